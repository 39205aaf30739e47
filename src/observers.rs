//! Per-frame reporting utilities that ride along with the step loop.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use glam::Vec3;
use image::{GrayImage, RgbImage, RgbaImage};
use log::{info, log, warn};

use crate::config::BenchmarkSettings;
use crate::frame::{FrameConverter, Pose};
use crate::runner::{FrameContext, FrameObserver};
use crate::sim::{
    ActionGoal, ActionPathfinder, ActionShortestPath, AgentId, Pathfinder, SemanticScene,
    SensorImage, ShortestPath, Simulator,
};

/// Objects covering less than this share of the frame are not reported.
const MASK_REPORT_RATIO: f64 = 0.01;
const PALETTE_SIZE: u32 = 40;
const DEPTH_SCALE_METRES: f32 = 10.0;
/// Sampled action-path goals must lie strictly inside this geodesic band.
const GOAL_MIN_DISTANCE: f32 = 2.5;
const GOAL_MAX_DISTANCE: f32 = 5.0;
/// Navigable-point samples tried per goal heading.
pub const GOAL_SAMPLE_LIMIT: usize = 1000;

/// Builds the observers switched on in `settings`.
pub fn default_observers(settings: &BenchmarkSettings) -> Vec<Box<dyn FrameObserver>> {
    let mut observers: Vec<Box<dyn FrameObserver>> = Vec::new();
    if settings.convert_pose {
        observers.push(Box::new(PoseConversionObserver::new()));
    }
    if let (true, Some(goal)) = (settings.compute_shortest_path, settings.goal_position) {
        observers.push(Box::new(ShortestPathObserver::new(Vec3::from_array(goal))));
    }
    if settings.print_semantic_mask_stats {
        observers.push(Box::new(SemanticStatsObserver::new()));
    }
    if settings.save_png {
        observers.push(Box::new(ImageSaver::new(settings.output_dir.clone())));
    }
    observers
}

/// [`default_observers`] plus the ones that need the simulator's start
/// state to set up.
pub fn prepare_observers(
    sim: &mut dyn Simulator,
    settings: &BenchmarkSettings,
) -> Result<Vec<Box<dyn FrameObserver>>> {
    let mut observers = default_observers(settings);
    if settings.compute_action_shortest_path {
        let observer =
            ActionPathObserver::prepare(sim, settings.default_agent, &settings.goal_headings)?;
        observers.push(Box::new(observer));
    }
    Ok(observers)
}

#[derive(Default)]
pub struct PoseConversionObserver {
    converter: FrameConverter,
    last: Option<Pose>,
}

impl PoseConversionObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_pose(&self) -> Option<Pose> {
        self.last
    }
}

impl FrameObserver for PoseConversionObserver {
    fn name(&self) -> &str {
        "pose_conversion"
    }

    fn observe(&mut self, ctx: &FrameContext<'_>, _sim: &mut dyn Simulator) -> Result<()> {
        let pose = self.converter.convert_state(ctx.state);
        log!(
            ctx.level(),
            "replica position {:?} rotation {:?}",
            pose.position,
            pose.rotation
        );
        self.last = Some(pose);
        Ok(())
    }
}

pub struct ShortestPathObserver {
    goal: Vec3,
    last_distance: Option<f32>,
    failures: u64,
}

impl ShortestPathObserver {
    pub fn new(goal: Vec3) -> Self {
        Self {
            goal,
            last_distance: None,
            failures: 0,
        }
    }

    /// Geodesic distance of the latest successful query.
    pub fn last_distance(&self) -> Option<f32> {
        self.last_distance
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl FrameObserver for ShortestPathObserver {
    fn name(&self) -> &str {
        "shortest_path"
    }

    fn observe(&mut self, ctx: &FrameContext<'_>, sim: &mut dyn Simulator) -> Result<()> {
        let mut path = ShortestPath::new(ctx.state.position, self.goal);
        if sim.pathfinder().find_path(&mut path) {
            log!(
                ctx.level(),
                "shortest_path.geodesic_distance {}",
                path.geodesic_distance
            );
            self.last_distance = Some(path.geodesic_distance);
        } else {
            self.failures += 1;
            log!(ctx.level(), "no path to goal {:?}", self.goal);
        }
        Ok(())
    }
}

/// Samples one goal per heading whose geodesic distance from `start` lies
/// in the goal band. Headings with no hit after [`GOAL_SAMPLE_LIMIT`]
/// samples are skipped.
pub fn sample_action_goals(
    pathfinder: &mut dyn Pathfinder,
    start: Vec3,
    headings: &[f32],
) -> Vec<ActionGoal> {
    let mut goals = Vec::with_capacity(headings.len());
    for &heading_deg in headings {
        let found = (0..GOAL_SAMPLE_LIMIT).find_map(|_| {
            let candidate = pathfinder.random_navigable_point();
            let mut path = ShortestPath::new(start, candidate);
            let in_band = pathfinder.find_path(&mut path)
                && path.geodesic_distance > GOAL_MIN_DISTANCE
                && path.geodesic_distance < GOAL_MAX_DISTANCE;
            in_band.then_some(candidate)
        });
        match found {
            Some(position) => goals.push(ActionGoal {
                position,
                heading_deg,
            }),
            None => warn!(
                "no goal {GOAL_MIN_DISTANCE}-{GOAL_MAX_DISTANCE} m from {start:?} \
                 for heading {heading_deg}"
            ),
        }
    }
    goals
}

/// Replans the action sequence to the sampled goals from every frame's pose.
pub struct ActionPathObserver {
    finder: ActionPathfinder,
    path: ActionShortestPath,
    failures: u64,
}

impl ActionPathObserver {
    /// Samples goals around the agent's current state and plans once.
    pub fn prepare(sim: &mut dyn Simulator, agent: AgentId, headings: &[f32]) -> Result<Self> {
        let finder = sim
            .action_pathfinder(agent)
            .ok_or_else(|| anyhow!("agent {agent} has no action pathfinder"))?;
        let start = sim.agent_state(agent)?;
        let goals = sample_action_goals(sim.pathfinder(), start.position, headings);
        let mut path = ActionShortestPath::new(start, goals);
        if !finder.find_path(&*sim.pathfinder(), &mut path) {
            warn!(
                "no action path from {:?} to any of {} goal(s)",
                start.position,
                path.requested_ends.len()
            );
        }
        info!("len(action_shortest_path.actions) {}", path.actions.len());
        Ok(Self {
            finder,
            path,
            failures: 0,
        })
    }

    pub fn path(&self) -> &ActionShortestPath {
        &self.path
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl FrameObserver for ActionPathObserver {
    fn name(&self) -> &str {
        "action_shortest_path"
    }

    fn observe(&mut self, ctx: &FrameContext<'_>, sim: &mut dyn Simulator) -> Result<()> {
        self.path.requested_start = ctx.state;
        if !self.finder.find_path(&*sim.pathfinder(), &mut self.path) {
            self.failures += 1;
        }
        log!(
            ctx.level(),
            "len(action_shortest_path.actions) {}",
            self.path.actions.len()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectShare {
    pub id: u32,
    pub category: String,
    pub pixel_ratio: f64,
}

/// Share of the frame covered by each semantic id, keeping only objects
/// above 1% of the pixels. Ids missing from the scene are `unknown`.
pub fn semantic_mask_stats(mask: &SensorImage<u32>, scene: &SemanticScene) -> Vec<ObjectShare> {
    let total = mask.pixel_count();
    if total == 0 {
        return Vec::new();
    }
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for id in &mask.data {
        *counts.entry(*id).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(id, count)| (id, count as f64 / total as f64))
        .filter(|(_, ratio)| *ratio > MASK_REPORT_RATIO)
        .map(|(id, pixel_ratio)| ObjectShare {
            id,
            category: scene
                .object(id)
                .map(|object| object.category.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            pixel_ratio,
        })
        .collect()
}

#[derive(Default)]
pub struct SemanticStatsObserver {
    last: Vec<ObjectShare>,
}

impl SemanticStatsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> &[ObjectShare] {
        &self.last
    }
}

impl FrameObserver for SemanticStatsObserver {
    fn name(&self) -> &str {
        "semantic_mask_stats"
    }

    fn observe(&mut self, ctx: &FrameContext<'_>, sim: &mut dyn Simulator) -> Result<()> {
        let Some(mask) = ctx.observations.semantic.as_ref() else {
            return Ok(());
        };
        self.last = semantic_mask_stats(mask, sim.semantic_scene());
        log!(ctx.level(), "pixel statistics for frame {}", ctx.frame);
        for share in &self.last {
            log!(
                ctx.level(),
                "obj_id:{},category:{},pixel_ratio:{:.4}",
                share.id,
                share.category,
                share.pixel_ratio
            );
        }
        Ok(())
    }
}

/// Writes every frame's images as `test.rgba.NNNNN.png`,
/// `test.depth.NNNNN.png` and `test.sem.NNNNN.png`.
pub struct ImageSaver {
    dir: PathBuf,
    palette: Vec<[u8; 3]>,
    created: bool,
}

impl ImageSaver {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            palette: semantic_palette(),
            created: false,
        }
    }
}

impl FrameObserver for ImageSaver {
    fn name(&self) -> &str {
        "image_saver"
    }

    fn observe(&mut self, ctx: &FrameContext<'_>, _sim: &mut dyn Simulator) -> Result<()> {
        if !self.created {
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("Failed to create {}", self.dir.display()))?;
            self.created = true;
        }
        let frame = ctx.frame;
        let obs = ctx.observations;

        if let Some(color) = &obs.color {
            let raw: Vec<u8> = color.data.iter().flatten().copied().collect();
            match RgbaImage::from_raw(color.width, color.height, raw) {
                Some(img) => img.save(self.dir.join(format!("test.rgba.{frame:05}.png")))?,
                None => warn!("color frame {frame} has the wrong size, skipped"),
            }
        }
        if let Some(depth) = &obs.depth {
            let raw: Vec<u8> = depth
                .data
                .iter()
                .map(|d| (d / DEPTH_SCALE_METRES * 255.0).clamp(0.0, 255.0) as u8)
                .collect();
            match GrayImage::from_raw(depth.width, depth.height, raw) {
                Some(img) => img.save(self.dir.join(format!("test.depth.{frame:05}.png")))?,
                None => warn!("depth frame {frame} has the wrong size, skipped"),
            }
        }
        if let Some(semantic) = &obs.semantic {
            let raw: Vec<u8> = semantic
                .data
                .iter()
                .flat_map(|id| self.palette[(id % PALETTE_SIZE) as usize])
                .collect();
            match RgbImage::from_raw(semantic.width, semantic.height, raw) {
                Some(img) => img.save(self.dir.join(format!("test.sem.{frame:05}.png")))?,
                None => warn!("semantic frame {frame} has the wrong size, skipped"),
            }
        }
        Ok(())
    }
}

/// 40 well-separated colours, golden-angle hue steps with alternating value.
/// d3 `category20` followed by `category20b`.
pub const SEMANTIC_PALETTE: [[u8; 3]; PALETTE_SIZE as usize] = [
    [31, 119, 180], [174, 199, 232], [255, 127, 14], [255, 187, 120],
    [44, 160, 44], [152, 223, 138], [214, 39, 40], [255, 152, 150],
    [148, 103, 189], [197, 176, 213], [140, 86, 75], [196, 156, 148],
    [227, 119, 194], [247, 182, 210], [127, 127, 127], [199, 199, 199],
    [188, 189, 34], [219, 219, 141], [23, 190, 207], [158, 218, 229],
    [57, 59, 121], [82, 84, 163], [107, 110, 207], [156, 158, 222],
    [99, 121, 57], [140, 162, 82], [181, 207, 107], [206, 219, 156],
    [140, 109, 49], [189, 158, 57], [231, 186, 82], [231, 203, 148],
    [132, 60, 57], [173, 73, 74], [214, 97, 107], [231, 150, 156],
    [123, 65, 115], [165, 81, 148], [206, 109, 189], [222, 158, 214],
];

pub fn semantic_palette() -> Vec<[u8; 3]> {
    SEMANTIC_PALETTE.to_vec()
}
