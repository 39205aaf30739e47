use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use glam::Vec3;
use log::{info, log, warn, Level};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::BenchmarkSettings;
use crate::error::SimError;
use crate::observers::prepare_observers;
use crate::rng::RngManager;
use crate::sim::{AgentId, AgentState, Observations, ShortestPath, Simulator, SimulatorFactory};

/// Navigable-point samples drawn before a high start position is accepted.
pub const START_SAMPLE_LIMIT: usize = 100;

/// Upper bound on the per-step timing buffer reserved up front; longer
/// trials grow it as they go.
const STEP_TIMES_PREALLOC: u64 = 1 << 16;

/// Timing of one pass of the step loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub frames: u64,
    pub total_time: f64,
    pub frame_time: f64,
    pub fps: f64,
    pub per_step_times: Vec<f64>,
}

impl TrialResult {
    pub fn from_timings(total: Duration, frames: u64, per_step_times: Vec<f64>) -> Self {
        // A zero-length window would make fps infinite; clamp to one tick.
        let total_time = total.max(Duration::from_nanos(1)).as_secs_f64();
        let frame_time = total_time / frames.max(1) as f64;
        Self {
            frames,
            total_time,
            frame_time,
            fps: 1.0 / frame_time,
            per_step_times,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartPlacement {
    pub state: AgentState,
    pub samples: usize,
    /// False when every sample stayed above the height threshold and the
    /// last one was kept anyway.
    pub accepted: bool,
}

/// Places the agent at a random start, resampling navigable points until one
/// is at or below `height_threshold` (ground floor). After
/// [`START_SAMPLE_LIMIT`] rejected samples the last one is used regardless.
pub fn init_agent_state(
    sim: &mut dyn Simulator,
    agent: AgentId,
    height_threshold: f32,
) -> Result<StartPlacement, SimError> {
    let mut state = sim.initialize_agent(agent)?;
    let mut samples = 0;
    while state.position.y > height_threshold && samples < START_SAMPLE_LIMIT {
        state.position = sim.pathfinder().random_navigable_point();
        samples += 1;
    }
    let accepted = state.position.y <= height_threshold;
    if !accepted {
        warn!(
            "no start position below y={height_threshold} after {samples} samples, keeping {:?}",
            state.position
        );
    }
    sim.set_agent_state(agent, state)?;
    Ok(StartPlacement {
        state,
        samples,
        accepted,
    })
}

pub struct FrameContext<'a> {
    pub frame: u64,
    pub action: &'a str,
    pub observations: &'a Observations,
    pub state: AgentState,
    pub silent: bool,
}

impl FrameContext<'_> {
    /// Per-frame chatter is `info` normally and `trace` when silent.
    pub fn level(&self) -> Level {
        if self.silent {
            Level::Trace
        } else {
            Level::Info
        }
    }
}

/// Reporting hook run after every step, outside the per-step timing.
pub trait FrameObserver {
    fn name(&self) -> &str;
    fn observe(&mut self, ctx: &FrameContext<'_>, sim: &mut dyn Simulator) -> Result<()>;
}

pub struct StepLoopBuilder {
    agent: AgentId,
    max_frames: u64,
    silent: bool,
    observers: Vec<Box<dyn FrameObserver>>,
}

impl StepLoopBuilder {
    pub fn new(settings: &BenchmarkSettings) -> Self {
        Self {
            agent: settings.default_agent,
            max_frames: settings.max_frames,
            silent: settings.silent,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: impl FrameObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn with_observers(mut self, observers: Vec<Box<dyn FrameObserver>>) -> Self {
        self.observers.extend(observers);
        self
    }

    pub fn build(self) -> StepLoop {
        StepLoop {
            agent: self.agent,
            max_frames: self.max_frames,
            silent: self.silent,
            observers: self.observers,
        }
    }
}

/// Drives one simulator through `max_frames` steps of a single action.
pub struct StepLoop {
    agent: AgentId,
    max_frames: u64,
    silent: bool,
    observers: Vec<Box<dyn FrameObserver>>,
}

impl StepLoop {
    pub fn observer_names(&self) -> Vec<&str> {
        self.observers.iter().map(|observer| observer.name()).collect()
    }

    /// Picks one action uniformly at random and repeats it every frame.
    ///
    /// Every step is timed individually. The trial's wall-clock window starts
    /// again at frame 1 so first-frame warm-up stays out of `total_time`.
    pub fn run_trial(&mut self, sim: &mut dyn Simulator, rng: &mut impl Rng) -> Result<TrialResult> {
        let actions = sim.action_names(self.agent)?;
        let action = actions
            .choose(rng)
            .ok_or_else(|| anyhow!("agent {} has no actions", self.agent))?
            .clone();

        let mut frames = 0_u64;
        let reserved = self.max_frames.min(STEP_TIMES_PREALLOC) as usize;
        let mut per_step_times = Vec::with_capacity(reserved);
        let mut start = Instant::now();
        while frames < self.max_frames {
            if frames == 1 {
                start = Instant::now();
            }
            let step_start = Instant::now();
            let observations = sim.step(&action)?;
            per_step_times.push(step_start.elapsed().as_secs_f64());

            let ctx = FrameContext {
                frame: frames,
                action: &action,
                observations: &observations,
                state: sim.last_state(),
                silent: self.silent,
            };
            log!(
                ctx.level(),
                "frame {} action {} position {:?} rotation {:?}",
                frames,
                action,
                ctx.state.position,
                ctx.state.rotation
            );
            for observer in &mut self.observers {
                observer.observe(&ctx, sim)?;
            }
            frames += 1;
        }

        Ok(TrialResult::from_timings(
            start.elapsed(),
            frames,
            per_step_times,
        ))
    }
}

/// Single-simulator run: construct, place the agent, optionally report the
/// semantic scene and initial shortest path, run one trial, close.
pub fn run_example<F: SimulatorFactory + ?Sized>(
    factory: &F,
    settings: &BenchmarkSettings,
) -> Result<TrialResult> {
    settings.validate()?;
    let mut sim = factory.create(settings, 0)?;
    let outcome = example_trial(sim.as_mut(), settings);
    sim.close();
    outcome
}

fn example_trial(sim: &mut dyn Simulator, settings: &BenchmarkSettings) -> Result<TrialResult> {
    let mut rng = RngManager::new(settings.seed);
    let start = init_agent_state(sim, settings.default_agent, settings.start_height_threshold)?;
    if !settings.silent {
        info!(
            "start position {:?} rotation {:?}",
            start.state.position, start.state.rotation
        );
    }

    if settings.print_semantic_scene {
        for line in sim.semantic_scene().describe() {
            info!("{line}");
        }
    }

    if let (true, Some(goal)) = (settings.compute_shortest_path, settings.goal_position) {
        let mut path = ShortestPath::new(start.state.position, Vec3::from_array(goal));
        if sim.pathfinder().find_path(&mut path) {
            info!("shortest_path.geodesic_distance {}", path.geodesic_distance);
        } else {
            warn!("no path from start {:?} to goal {:?}", path.requested_start, goal);
        }
    }

    let observers = prepare_observers(sim, settings)?;
    let mut step_loop = StepLoopBuilder::new(settings)
        .with_observers(observers)
        .build();
    step_loop.run_trial(sim, &mut rng.stream("actions"))
}
