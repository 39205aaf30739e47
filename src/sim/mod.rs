//! The simulator collaborator.
//!
//! The harness never looks inside a simulator: it constructs one through a
//! [`SimulatorFactory`], steps it with action names, queries agent state and
//! asks its [`Pathfinder`] for navigable points and shortest paths.

pub mod action_path;
pub mod kinematic;
pub mod navgrid;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::config::BenchmarkSettings;
use crate::error::SimError;

pub use action_path::{ActionGoal, ActionPathfinder, ActionShortestPath};
pub use kinematic::{KinematicFactory, KinematicSimulator};

pub type AgentId = usize;

pub const COLOR_SENSOR: &str = "color_sensor";
pub const DEPTH_SENSOR: &str = "depth_sensor";
pub const SEMANTIC_SENSOR: &str = "semantic_sensor";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

/// Row-major image produced by one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorImage<T> {
    pub width: u32,
    pub height: u32,
    pub data: Vec<T>,
}

impl<T: Clone> SensorImage<T> {
    pub fn filled(width: u32, height: u32, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }
}

impl<T> SensorImage<T> {
    pub fn pixel_count(&self) -> usize {
        self.data.len()
    }
}

/// Observations returned by a single step, one image per enabled sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations {
    pub color: Option<SensorImage<[u8; 4]>>,
    pub depth: Option<SensorImage<f32>>,
    pub semantic: Option<SensorImage<u32>>,
}

impl Observations {
    pub fn sensor_names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(3);
        if self.color.is_some() {
            names.push(COLOR_SENSOR);
        }
        if self.depth.is_some() {
            names.push(DEPTH_SENSOR);
        }
        if self.semantic.is_some() {
            names.push(SEMANTIC_SENSOR);
        }
        names
    }
}

/// Axis-aligned box given by its center and full extents.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aabb {
    pub center: Vec3,
    pub sizes: Vec3,
}

impl Aabb {
    pub fn from_corners(min: Vec3, max: Vec3) -> Self {
        Self {
            center: (min + max) * 0.5,
            sizes: max - min,
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.sizes * 0.5
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.sizes * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Self {
        Self::from_corners(self.min().min(other.min()), self.max().max(other.max()))
    }

    pub fn contains_xz(&self, point: Vec3) -> bool {
        let (min, max) = (self.min(), self.max());
        (min.x..=max.x).contains(&point.x) && (min.z..=max.z).contains(&point.z)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticObject {
    pub id: u32,
    pub category: String,
    /// Filled in by the backend from the object's footprint.
    #[serde(skip)]
    pub aabb: Aabb,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SemanticRegion {
    pub id: String,
    pub category: String,
    pub aabb: Aabb,
    /// Ids into [`SemanticScene::objects`].
    pub objects: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SemanticLevel {
    pub id: String,
    pub aabb: Aabb,
    pub regions: Vec<SemanticRegion>,
}

/// House, levels, regions and objects of a scene. `objects` is the flat
/// list semantic mask ids resolve against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SemanticScene {
    pub aabb: Aabb,
    pub levels: Vec<SemanticLevel>,
    pub objects: Vec<SemanticObject>,
}

impl SemanticScene {
    pub fn object(&self, id: u32) -> Option<&SemanticObject> {
        self.objects.iter().find(|object| object.id == id)
    }

    /// One line per house, level, region and object, nested in that order.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "House center:{} dims:{}",
            self.aabb.center, self.aabb.sizes
        )];
        for level in &self.levels {
            lines.push(format!(
                "Level id:{}, center:{}, dims:{}",
                level.id, level.aabb.center, level.aabb.sizes
            ));
            for region in &level.regions {
                lines.push(format!(
                    "Region id:{}, category:{}, center:{}, dims:{}",
                    region.id, region.category, region.aabb.center, region.aabb.sizes
                ));
                for object in region.objects.iter().filter_map(|id| self.object(*id)) {
                    lines.push(format!(
                        "Object id:{}, category:{}, center:{}, dims:{}",
                        object.id, object.category, object.aabb.center, object.aabb.sizes
                    ));
                }
            }
        }
        lines
    }
}

/// A shortest-path query; `points` and `geodesic_distance` are filled in by
/// [`Pathfinder::find_path`].
#[derive(Debug, Clone, PartialEq)]
pub struct ShortestPath {
    pub requested_start: Vec3,
    pub requested_end: Vec3,
    pub points: Vec<Vec3>,
    pub geodesic_distance: f32,
}

impl ShortestPath {
    pub fn new(requested_start: Vec3, requested_end: Vec3) -> Self {
        Self {
            requested_start,
            requested_end,
            points: Vec::new(),
            geodesic_distance: f32::INFINITY,
        }
    }
}

pub trait Pathfinder {
    fn random_navigable_point(&mut self) -> Vec3;
    /// Returns false when no path exists; the query is left with an infinite
    /// geodesic distance in that case.
    fn find_path(&self, path: &mut ShortestPath) -> bool;
    fn is_navigable(&self, point: Vec3) -> bool;
}

pub trait Simulator {
    fn action_names(&self, agent: AgentId) -> Result<Vec<String>, SimError>;
    /// Places the agent at a fresh start state and returns it.
    fn initialize_agent(&mut self, agent: AgentId) -> Result<AgentState, SimError>;
    fn agent_state(&self, agent: AgentId) -> Result<AgentState, SimError>;
    fn set_agent_state(&mut self, agent: AgentId, state: AgentState) -> Result<(), SimError>;
    /// Applies `action` to the default agent and renders every enabled sensor.
    fn step(&mut self, action: &str) -> Result<Observations, SimError>;
    fn last_state(&self) -> AgentState;
    fn pathfinder(&mut self) -> &mut dyn Pathfinder;
    /// Plans action sequences for `agent`, if its action space supports it.
    fn action_pathfinder(&self, _agent: AgentId) -> Option<ActionPathfinder> {
        None
    }
    fn semantic_scene(&self) -> &SemanticScene;
    fn seed(&mut self, seed: u64);
    fn close(&mut self);
}

/// Worker-init contract: called once per worker, before any timed work, to
/// build and seed that worker's private simulator.
pub trait SimulatorFactory: Sync {
    fn create(
        &self,
        settings: &BenchmarkSettings,
        worker: usize,
    ) -> Result<Box<dyn Simulator>, SimError>;
}
