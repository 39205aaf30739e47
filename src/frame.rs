//! Frame-of-reference conversion between the simulator's camera convention
//! (Y up, -Z forward) and the replica convention (Z forward, -Y up).
//!
//! The conversion builds homogeneous transforms and composes
//! `flip * inverse(pose) * axes`, then inverts the result so the output is
//! the agent's pose seen from the replica frame.

use glam::{DMat3, DMat4, DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::sim::AgentState;

const PARALLEL_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: DVec3,
    pub rotation: DQuat,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: DVec3::ZERO,
        rotation: DQuat::IDENTITY,
    };

    pub fn new(position: DVec3, rotation: DQuat) -> Self {
        Self { position, rotation }
    }

    pub fn to_matrix(&self) -> DMat4 {
        DMat4::from_rotation_translation(self.rotation.normalize(), self.position)
    }

    pub fn from_matrix(matrix: &DMat4) -> Self {
        let rotation = DMat3::from_mat4(*matrix);
        Self {
            position: matrix.w_axis.truncate(),
            rotation: DQuat::from_mat3(&rotation).normalize(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite()
    }

    /// Distance between rotations, insensitive to the q / -q ambiguity.
    pub fn rotation_distance(&self, other: &Pose) -> f64 {
        let a = self.rotation.normalize();
        let b = other.rotation.normalize();
        let dot = a.dot(b);
        let b = if dot < 0.0 { -b } else { b };
        (a - b).length()
    }
}

impl From<AgentState> for Pose {
    fn from(state: AgentState) -> Self {
        let [x, y, z] = state.position.to_array();
        let [qx, qy, qz, qw] = state.rotation.to_array();
        Self {
            position: DVec3::new(x as f64, y as f64, z as f64),
            rotation: DQuat::from_xyzw(qx as f64, qy as f64, qz as f64, qw as f64),
        }
    }
}

/// Shortest rotation taking unit vector `from` onto `to`.
///
/// Opposite vectors rotate half a turn about the basis axis least aligned
/// with `from`, made orthogonal to it.
pub fn quat_from_two_vectors(from: DVec3, to: DVec3) -> DQuat {
    let from = from.normalize();
    let to = to.normalize();
    let dot = from.dot(to);
    if dot < -1.0 + PARALLEL_EPS {
        let abs = from.abs();
        let basis = if abs.x <= abs.y && abs.x <= abs.z {
            DVec3::X
        } else if abs.y <= abs.z {
            DVec3::Y
        } else {
            DVec3::Z
        };
        let axis = (basis - from * from.dot(basis)).normalize();
        return DQuat::from_axis_angle(axis, std::f64::consts::PI);
    }
    if dot > 1.0 - PARALLEL_EPS {
        return DQuat::IDENTITY;
    }
    let axis = from.cross(to);
    DQuat::from_xyzw(axis.x, axis.y, axis.z, 1.0 + dot).normalize()
}

/// Fixed transforms between the simulator frame and the replica frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameConverter {
    /// Simulator axes expressed in replica axes.
    axes: DMat4,
    /// Camera forward/backward flip.
    flip: DMat4,
}

impl Default for FrameConverter {
    fn default() -> Self {
        Self::habitat_to_replica()
    }
}

impl FrameConverter {
    pub fn habitat_to_replica() -> Self {
        let axes = quat_from_two_vectors(DVec3::NEG_Z, DVec3::NEG_Y);
        let flip = quat_from_two_vectors(DVec3::NEG_Z, DVec3::Z);
        Self {
            axes: DMat4::from_quat(axes),
            flip: DMat4::from_quat(flip),
        }
    }

    pub fn to_target(&self, pose: &Pose) -> Pose {
        let camera_from_source = pose.to_matrix().inverse();
        let camera_from_target = self.flip * camera_from_source * self.axes;
        Pose::from_matrix(&camera_from_target.inverse())
    }

    /// Inverse of [`FrameConverter::to_target`].
    pub fn to_source(&self, pose: &Pose) -> Pose {
        let camera_from_target = pose.to_matrix().inverse();
        let camera_from_source = self.flip.inverse() * camera_from_target * self.axes.inverse();
        Pose::from_matrix(&camera_from_source.inverse())
    }

    pub fn convert_state(&self, state: AgentState) -> Pose {
        self.to_target(&Pose::from(state))
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;

    const TOL: f64 = 1e-5;

    fn assert_pose_close(a: &Pose, b: &Pose) {
        assert!(
            a.position.distance(b.position) < TOL,
            "positions differ: {:?} vs {:?}",
            a.position,
            b.position
        );
        assert!(
            a.rotation_distance(b) < TOL,
            "rotations differ: {:?} vs {:?}",
            a.rotation,
            b.rotation
        );
    }

    #[test]
    fn opposite_vectors_flip_about_an_orthogonal_axis() {
        let q = quat_from_two_vectors(DVec3::NEG_Z, DVec3::Z);
        assert!(q.is_finite());
        assert!((q * DVec3::NEG_Z - DVec3::Z).length() < 1e-12);
        // Least aligned axis with -Z is X, so the flip also negates Y.
        assert!((q * DVec3::Y - DVec3::NEG_Y).length() < 1e-12);
    }

    #[test]
    fn two_vector_rotation_maps_from_onto_to() {
        let q = quat_from_two_vectors(DVec3::NEG_Z, DVec3::NEG_Y);
        assert!((q * DVec3::NEG_Z - DVec3::NEG_Y).length() < 1e-12);
    }

    #[test]
    fn identity_pose_converts_to_finite_pose() {
        let converter = FrameConverter::habitat_to_replica();
        let out = converter.to_target(&Pose::IDENTITY);
        assert!(out.is_finite());
        let expected = Pose::from_matrix(&(converter.flip * converter.axes).inverse());
        assert_pose_close(&out, &expected);
    }

    #[test]
    fn conversion_round_trips() {
        let converter = FrameConverter::habitat_to_replica();
        let poses = [
            Pose::new(DVec3::new(1.0, 0.2, -3.5), DQuat::from_rotation_y(0.7)),
            Pose::new(
                DVec3::new(-4.25, 1.5, 2.0),
                DQuat::from_euler(glam::EulerRot::YXZ, 2.1, -0.3, 0.05),
            ),
            Pose::new(DVec3::new(0.0, 0.0, 0.0), DQuat::from_rotation_x(std::f64::consts::PI)),
            Pose::new(DVec3::new(7.0, -2.0, 0.5), DQuat::from_rotation_y(std::f64::consts::PI)),
        ];
        for pose in poses {
            let target = converter.to_target(&pose);
            assert!(target.is_finite());
            let back = converter.to_source(&target);
            assert_pose_close(&pose, &back);
        }
    }

    #[test]
    fn half_turn_rotations_stay_finite() {
        let converter = FrameConverter::habitat_to_replica();
        for rotation in [
            DQuat::from_rotation_x(std::f64::consts::PI),
            DQuat::from_rotation_y(std::f64::consts::PI),
            DQuat::from_rotation_z(std::f64::consts::PI),
        ] {
            let out = converter.to_target(&Pose::new(DVec3::ONE, rotation));
            assert!(out.is_finite());
            assert!((out.rotation.length() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn agent_state_converts_through_f64() {
        let state = AgentState {
            position: Vec3::new(1.0, 0.5, -2.0),
            rotation: Quat::from_rotation_y(0.3),
        };
        let pose = Pose::from(state);
        assert!((pose.position - DVec3::new(1.0, 0.5, -2.0)).length() < 1e-6);
        let converter = FrameConverter::default();
        assert!(converter.convert_state(state).is_finite());
    }
}
