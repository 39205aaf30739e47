//! Action-space shortest paths.
//!
//! Turns a geodesic path into the discrete actions an agent would take to
//! follow it: turn until facing the next waypoint, step forward, and finally
//! turn to the goal heading. With several goals the geodesically nearest
//! reachable one wins.

use std::f32::consts::{PI, TAU};

use glam::{Quat, Vec2, Vec3};

use super::{AgentState, Pathfinder, ShortestPath};

/// Plans longer than this are treated as unreachable.
pub const DEFAULT_MAX_ACTIONS: usize = 10_000;

/// A goal pose: a position plus the yaw (degrees about +Y) to end facing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionGoal {
    pub position: Vec3,
    pub heading_deg: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionShortestPath {
    pub requested_start: AgentState,
    pub requested_ends: Vec<ActionGoal>,
    /// Filled in by [`ActionPathfinder::find_path`].
    pub actions: Vec<String>,
    /// Index into `requested_ends` of the goal the actions reach.
    pub goal: Option<usize>,
}

impl ActionShortestPath {
    pub fn new(requested_start: AgentState, requested_ends: Vec<ActionGoal>) -> Self {
        Self {
            requested_start,
            requested_ends,
            ..Self::default()
        }
    }
}

/// Greedy follower for an agent with one forward action and two turns.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPathfinder {
    forward: String,
    turn_left: String,
    turn_right: String,
    step: f32,
    turn: f32,
    max_actions: usize,
}

impl ActionPathfinder {
    /// `step` is the forward distance in metres, `turn_deg` the yaw change
    /// of one turn; `turn_left` increases yaw.
    pub fn new(
        forward: impl Into<String>,
        turn_left: impl Into<String>,
        turn_right: impl Into<String>,
        step: f32,
        turn_deg: f32,
    ) -> Self {
        Self {
            forward: forward.into(),
            turn_left: turn_left.into(),
            turn_right: turn_right.into(),
            step,
            turn: turn_deg.to_radians(),
            max_actions: DEFAULT_MAX_ACTIONS,
        }
    }

    pub fn with_max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = max_actions;
        self
    }

    /// Plans towards every requested end and keeps the one with the shortest
    /// geodesic distance. Returns false when none is reachable.
    pub fn find_path(&self, pathfinder: &dyn Pathfinder, path: &mut ActionShortestPath) -> bool {
        path.actions.clear();
        path.goal = None;

        let mut best: Option<(f32, usize, Vec<String>)> = None;
        for (index, goal) in path.requested_ends.iter().enumerate() {
            let mut query = ShortestPath::new(path.requested_start.position, goal.position);
            if !pathfinder.find_path(&mut query) {
                continue;
            }
            if best
                .as_ref()
                .is_some_and(|(distance, _, _)| *distance <= query.geodesic_distance)
            {
                continue;
            }
            let start = path.requested_start;
            if let Some(actions) = self.follow(start, &query.points, goal.heading_deg) {
                best = Some((query.geodesic_distance, index, actions));
            }
        }

        match best {
            Some((_, index, actions)) => {
                path.goal = Some(index);
                path.actions = actions;
                true
            }
            None => false,
        }
    }

    fn follow(&self, start: AgentState, points: &[Vec3], heading_deg: f32) -> Option<Vec<String>> {
        let reach = self.step * 0.6;
        let mut position = Vec2::new(start.position.x, start.position.z);
        let mut yaw = yaw_of(start.rotation);
        let mut actions = Vec::new();

        for waypoint in points {
            let target = Vec2::new(waypoint.x, waypoint.z);
            loop {
                let offset = target - position;
                if offset.length() <= reach {
                    break;
                }
                let desired = (-offset.x).atan2(-offset.y);
                if !self.turn_towards(&mut yaw, desired, &mut actions) {
                    actions.push(self.forward.clone());
                    position += Vec2::new(-yaw.sin(), -yaw.cos()) * self.step;
                }
                if actions.len() > self.max_actions {
                    return None;
                }
            }
        }

        let heading = heading_deg.to_radians();
        while self.turn_towards(&mut yaw, heading, &mut actions) {
            if actions.len() > self.max_actions {
                return None;
            }
        }
        Some(actions)
    }

    /// Pushes one turn when `yaw` is more than half a turn off `desired`.
    fn turn_towards(&self, yaw: &mut f32, desired: f32, actions: &mut Vec<String>) -> bool {
        let diff = wrap_angle(desired - *yaw);
        if diff.abs() <= self.turn * 0.5 {
            return false;
        }
        if diff > 0.0 {
            actions.push(self.turn_left.clone());
            *yaw += self.turn;
        } else {
            actions.push(self.turn_right.clone());
            *yaw -= self.turn;
        }
        true
    }
}

/// Yaw about +Y of an agent that looks down its local -Z.
pub fn yaw_of(rotation: Quat) -> f32 {
    let forward = rotation * Vec3::NEG_Z;
    (-forward.x).atan2(-forward.z)
}

fn wrap_angle(angle: f32) -> f32 {
    (angle + PI).rem_euclid(TAU) - PI
}
