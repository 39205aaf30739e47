//! Headless kinematic backend.
//!
//! Agents slide over a [`NavGrid`]; sensors are produced by a column
//! raycaster so that stepping costs roughly what a small renderer would.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use glam::{Quat, Vec2, Vec3};
use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use super::navgrid::{Cell, Level, NavGrid};
use super::{
    Aabb, ActionPathfinder, AgentId, AgentState, Observations, Pathfinder, SemanticLevel,
    SemanticObject, SemanticRegion, SemanticScene, SensorImage, Simulator, SimulatorFactory,
};
use crate::config::BenchmarkSettings;
use crate::error::SimError;
use crate::rng::RngManager;

pub const MOVE_FORWARD: &str = "move_forward";
pub const TURN_LEFT: &str = "turn_left";
pub const TURN_RIGHT: &str = "turn_right";

pub const FORWARD_AMOUNT: f32 = 0.25;
pub const TURN_AMOUNT_DEG: f32 = 10.0;
const HFOV_DEG: f32 = 90.0;
const WALL_HEIGHT: f32 = 2.5;
const MAX_DEPTH: f32 = 10.0;

pub const FLOOR_ID: u32 = 0;
pub const WALL_ID: u32 = 1;

fn default_cell_size() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneDescription {
    pub name: String,
    #[serde(default = "default_cell_size")]
    pub cell_size: f32,
    pub levels: Vec<LevelDescription>,
    #[serde(default)]
    pub objects: Vec<SemanticObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelDescription {
    pub height: f32,
    /// World (x, z) of the map's top-left corner.
    #[serde(default)]
    pub origin: [f32; 2],
    pub map: String,
    /// Rooms of this level; the whole level is one region when empty.
    #[serde(default)]
    pub regions: Vec<RegionDescription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionDescription {
    pub category: String,
    /// Inclusive map cell bounds `[first_col, first_row, last_col, last_row]`.
    pub cells: [u32; 4],
}

impl SceneDescription {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let text = fs::read_to_string(path).map_err(|err| SimError::SceneLoad {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|err| SimError::SceneLoad {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSpec {
    pub width: u32,
    pub height: u32,
    pub sensor_height: f32,
    pub color: bool,
    pub depth: bool,
    pub semantic: bool,
}

impl SensorSpec {
    pub fn from_settings(settings: &BenchmarkSettings) -> Self {
        Self {
            width: settings.width,
            height: settings.height,
            sensor_height: settings.sensor_height,
            color: settings.color_sensor,
            depth: settings.depth_sensor,
            semantic: settings.semantic_sensor,
        }
    }
}

pub struct KinematicSimulator {
    scene_name: String,
    navgrid: NavGrid,
    semantic_scene: SemanticScene,
    agents: Vec<AgentState>,
    default_agent: AgentId,
    sensors: SensorSpec,
    rng: ChaCha8Rng,
    closed: bool,
}

impl KinematicSimulator {
    pub fn from_scene(
        scene: SceneDescription,
        sensors: SensorSpec,
        default_agent: AgentId,
    ) -> Result<Self, SimError> {
        let invalid = |message: String| SimError::SceneLoad {
            path: PathBuf::from(&scene.name),
            message,
        };
        let mut levels = Vec::with_capacity(scene.levels.len());
        for level in &scene.levels {
            let origin = Vec2::new(level.origin[0], level.origin[1]);
            levels.push(Level::parse(level.height, origin, &level.map).map_err(invalid)?);
        }
        let navgrid = NavGrid::new(scene.cell_size, levels).map_err(invalid)?;

        let semantic_scene = build_semantic_scene(&scene, &navgrid);

        Ok(Self {
            scene_name: scene.name,
            navgrid,
            semantic_scene,
            agents: vec![AgentState::default(); default_agent + 1],
            default_agent,
            sensors,
            rng: ChaCha8Rng::seed_from_u64(0),
            closed: false,
        })
    }

    pub fn scene_name(&self) -> &str {
        &self.scene_name
    }

    pub fn navgrid(&self) -> &NavGrid {
        &self.navgrid
    }

    fn agent_mut(&mut self, agent: AgentId) -> Result<&mut AgentState, SimError> {
        self.agents.get_mut(agent).ok_or(SimError::UnknownAgent(agent))
    }

    fn apply_action(&mut self, action: &str) -> Result<(), SimError> {
        let state = self.agents[self.default_agent];
        let next = match action {
            MOVE_FORWARD => {
                let target = state.position + state.rotation * Vec3::new(0.0, 0.0, -FORWARD_AMOUNT);
                let same_level = self.navgrid.level_of(target) == self.navgrid.level_of(state.position);
                if same_level && self.navgrid.is_navigable(target) {
                    AgentState {
                        position: target,
                        ..state
                    }
                } else {
                    state
                }
            }
            TURN_LEFT => AgentState {
                rotation: (state.rotation * Quat::from_rotation_y(TURN_AMOUNT_DEG.to_radians()))
                    .normalize(),
                ..state
            },
            TURN_RIGHT => AgentState {
                rotation: (state.rotation * Quat::from_rotation_y(-TURN_AMOUNT_DEG.to_radians()))
                    .normalize(),
                ..state
            },
            other => return Err(SimError::UnknownAction(other.to_string())),
        };
        self.agents[self.default_agent] = next;
        Ok(())
    }

    fn render(&self) -> Observations {
        let spec = self.sensors;
        let (width, height) = (spec.width, spec.height);
        let mut color = spec.color.then(|| SensorImage::filled(width, height, [0u8; 4]));
        let mut depth = spec.depth.then(|| SensorImage::filled(width, height, 0.0f32));
        let mut semantic = spec.semantic.then(|| SensorImage::filled(width, height, FLOOR_ID));

        let state = self.agents[self.default_agent];
        let Some(level) = self.navgrid.level_of(state.position) else {
            return Observations {
                color,
                depth,
                semantic,
            };
        };
        let forward = state.rotation * Vec3::NEG_Z;
        let forward = Vec3::new(forward.x, 0.0, forward.z).normalize_or_zero();
        let eye = Vec2::new(state.position.x, state.position.z);
        let hfov = HFOV_DEG.to_radians();
        let vfov = hfov * height as f32 / width as f32;
        let row_slopes: Vec<f32> = (0..height)
            .map(|row| ((0.5 - (row as f32 + 0.5) / height as f32) * vfov).tan())
            .collect();

        for col in 0..width {
            let yaw = (0.5 - (col as f32 + 0.5) / width as f32) * hfov;
            let ray = Quat::from_rotation_y(yaw) * forward;
            let hit = self
                .navgrid
                .raycast(level, eye, Vec2::new(ray.x, ray.z), MAX_DEPTH);
            let wall = hit.map(|hit| (hit.distance * yaw.cos(), hit.cell));

            for (row, slope) in row_slopes.iter().copied().enumerate() {
                let (z, id) = match wall {
                    Some((z, cell)) if (0.0..=WALL_HEIGHT).contains(&(spec.sensor_height + z * slope)) => {
                        (z, semantic_id(cell))
                    }
                    _ if slope < 0.0 => (spec.sensor_height / -slope * yaw.cos(), FLOOR_ID),
                    _ if slope > 0.0 => {
                        ((WALL_HEIGHT - spec.sensor_height).max(0.0) / slope * yaw.cos(), FLOOR_ID)
                    }
                    _ => (MAX_DEPTH, FLOOR_ID),
                };
                let z = z.min(MAX_DEPTH);
                let index = row * width as usize + col as usize;
                if let Some(image) = depth.as_mut() {
                    image.data[index] = z;
                }
                if let Some(image) = semantic.as_mut() {
                    image.data[index] = id;
                }
                if let Some(image) = color.as_mut() {
                    image.data[index] = shade(base_color(id, slope), z);
                }
            }
        }

        Observations {
            color,
            depth,
            semantic,
        }
    }
}

/// Box covering map cells `first..=last` of a level, extruded to wall height.
fn cell_box(level: &Level, cell_size: f32, first: (u32, u32), last: (u32, u32)) -> Aabb {
    let corner = |col: u32, row: u32| {
        Vec3::new(
            level.origin.x + col as f32 * cell_size,
            level.height,
            level.origin.y + row as f32 * cell_size,
        )
    };
    let max = corner(last.0 + 1, last.1 + 1) + Vec3::Y * WALL_HEIGHT;
    Aabb::from_corners(corner(first.0, first.1), max)
}

/// Derives the house/level/region/object hierarchy from the map footprints.
fn build_semantic_scene(scene: &SceneDescription, navgrid: &NavGrid) -> SemanticScene {
    let cell_size = navgrid.cell_size();
    let mut footprints: BTreeMap<u32, Aabb> = BTreeMap::new();
    let mut house: Option<Aabb> = None;
    let mut levels = Vec::with_capacity(navgrid.levels().len());

    for (index, (level, description)) in navgrid.levels().iter().zip(&scene.levels).enumerate() {
        let last = (level.cols() as u32 - 1, level.rows() as u32 - 1);
        let level_box = cell_box(level, cell_size, (0, 0), last);
        house = Some(house.map_or(level_box, |house| house.union(&level_box)));

        let mut regions: Vec<SemanticRegion> = if description.regions.is_empty() {
            vec![SemanticRegion {
                id: format!("{index}_0"),
                category: "room".to_string(),
                aabb: level_box,
                objects: Vec::new(),
            }]
        } else {
            description
                .regions
                .iter()
                .enumerate()
                .map(|(region, desc)| {
                    let [c0, r0, c1, r1] = desc.cells;
                    SemanticRegion {
                        id: format!("{index}_{region}"),
                        category: desc.category.clone(),
                        aabb: cell_box(
                            level,
                            cell_size,
                            (c0.min(c1), r0.min(r1)),
                            (c0.max(c1), r0.max(r1)),
                        ),
                        objects: Vec::new(),
                    }
                })
                .collect()
        };

        let mut on_level: BTreeMap<u32, Aabb> = BTreeMap::new();
        for row in 0..level.rows() {
            for col in 0..level.cols() {
                if let Cell::Object(id) = level.cell(col as i64, row as i64) {
                    let at = (col as u32, row as u32);
                    let cell = cell_box(level, cell_size, at, at);
                    on_level
                        .entry(id)
                        .and_modify(|aabb| *aabb = aabb.union(&cell))
                        .or_insert(cell);
                }
            }
        }
        for (id, aabb) in on_level {
            let region = regions
                .iter()
                .position(|region| region.aabb.contains_xz(aabb.center))
                .unwrap_or(0);
            regions[region].objects.push(id);
            footprints
                .entry(id)
                .and_modify(|total| *total = total.union(&aabb))
                .or_insert(aabb);
        }

        levels.push(SemanticLevel {
            id: index.to_string(),
            aabb: level_box,
            regions,
        });
    }

    let house = house.unwrap_or_default();
    let mut objects = vec![
        SemanticObject {
            id: FLOOR_ID,
            category: "floor".to_string(),
            aabb: house,
        },
        SemanticObject {
            id: WALL_ID,
            category: "wall".to_string(),
            aabb: house,
        },
    ];
    objects.extend(
        scene
            .objects
            .iter()
            .filter(|object| object.id > WALL_ID)
            .map(|object| SemanticObject {
                aabb: footprints.get(&object.id).copied().unwrap_or_default(),
                ..object.clone()
            }),
    );

    SemanticScene {
        aabb: house,
        levels,
        objects,
    }
}

fn semantic_id(cell: Cell) -> u32 {
    match cell {
        Cell::Object(id) => id,
        Cell::Wall | Cell::Floor => WALL_ID,
    }
}

fn base_color(id: u32, slope: f32) -> [u8; 3] {
    match id {
        FLOOR_ID if slope > 0.0 => [205, 205, 200],
        FLOOR_ID => [120, 105, 90],
        WALL_ID => [180, 170, 150],
        other => {
            let hash = other.wrapping_mul(2_654_435_761);
            [
                (hash >> 24) as u8 | 0x40,
                (hash >> 16) as u8 | 0x40,
                (hash >> 8) as u8 | 0x40,
            ]
        }
    }
}

fn shade(rgb: [u8; 3], depth: f32) -> [u8; 4] {
    let factor = 1.0 / (1.0 + 0.15 * depth);
    [
        (rgb[0] as f32 * factor) as u8,
        (rgb[1] as f32 * factor) as u8,
        (rgb[2] as f32 * factor) as u8,
        255,
    ]
}

impl Simulator for KinematicSimulator {
    fn action_names(&self, agent: AgentId) -> Result<Vec<String>, SimError> {
        if agent >= self.agents.len() {
            return Err(SimError::UnknownAgent(agent));
        }
        Ok(vec![
            MOVE_FORWARD.to_string(),
            TURN_LEFT.to_string(),
            TURN_RIGHT.to_string(),
        ])
    }

    fn initialize_agent(&mut self, agent: AgentId) -> Result<AgentState, SimError> {
        let position = self.navgrid.random_navigable_point();
        let yaw = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let state = AgentState {
            position,
            rotation: Quat::from_rotation_y(yaw),
        };
        *self.agent_mut(agent)? = state;
        Ok(state)
    }

    fn agent_state(&self, agent: AgentId) -> Result<AgentState, SimError> {
        self.agents
            .get(agent)
            .copied()
            .ok_or(SimError::UnknownAgent(agent))
    }

    fn set_agent_state(&mut self, agent: AgentId, state: AgentState) -> Result<(), SimError> {
        *self.agent_mut(agent)? = state;
        Ok(())
    }

    fn step(&mut self, action: &str) -> Result<Observations, SimError> {
        if self.closed {
            return Err(SimError::Closed);
        }
        self.apply_action(action)?;
        Ok(self.render())
    }

    fn last_state(&self) -> AgentState {
        self.agents[self.default_agent]
    }

    fn pathfinder(&mut self) -> &mut dyn Pathfinder {
        &mut self.navgrid
    }

    fn action_pathfinder(&self, agent: AgentId) -> Option<ActionPathfinder> {
        (agent < self.agents.len()).then(|| {
            ActionPathfinder::new(
                MOVE_FORWARD,
                TURN_LEFT,
                TURN_RIGHT,
                FORWARD_AMOUNT,
                TURN_AMOUNT_DEG,
            )
        })
    }

    fn semantic_scene(&self) -> &SemanticScene {
        &self.semantic_scene
    }

    fn seed(&mut self, seed: u64) {
        self.rng = RngManager::new(seed).fork("agent");
        self.navgrid.seed(seed);
    }

    fn close(&mut self) {
        if !self.closed {
            debug!("closing kinematic simulator for scene '{}'", self.scene_name);
        }
        self.closed = true;
    }
}

/// Builds a [`KinematicSimulator`] per worker from the settings' scene file.
#[derive(Debug, Clone, Default)]
pub struct KinematicFactory;

impl KinematicFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SimulatorFactory for KinematicFactory {
    fn create(
        &self,
        settings: &BenchmarkSettings,
        worker: usize,
    ) -> Result<Box<dyn Simulator>, SimError> {
        if settings.enable_physics && !settings.physics_config_file.exists() {
            return Err(SimError::PhysicsConfig(settings.physics_config_file.clone()));
        }
        let scene = SceneDescription::load(&settings.scene)?;
        let mut sim = KinematicSimulator::from_scene(
            scene,
            SensorSpec::from_settings(settings),
            settings.default_agent,
        )?;
        sim.seed(settings.seed);
        info!(
            "worker {worker}: loaded scene '{}' ({} navigable cells, {}x{} sensors)",
            sim.scene_name(),
            sim.navgrid().navigable_cell_count(),
            settings.width,
            settings.height
        );
        Ok(Box::new(sim))
    }
}
