//! Multi-worker benchmark harness.
//!
//! Every worker owns one simulator, meets the others at a rendezvous before
//! each of [`TRIALS`] timed trials and keeps its fastest trial. The harness
//! folds the per-worker bests into one [`AggregateReport`].

pub mod process;
pub mod protocol;
pub mod threads;

use anyhow::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::barrier::Rendezvous;
use crate::config::BenchmarkSettings;
use crate::error::HarnessError;
use crate::observers::prepare_observers;
use crate::rng::RngManager;
use crate::runner::{init_agent_state, StepLoopBuilder, TrialResult};
use crate::sim::{Simulator, SimulatorFactory};

pub use process::ProcessPool;
pub use threads::ThreadPool;

pub const TRIALS: usize = 3;

/// A worker's fastest trial, plus the frame times of all its trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub best: TrialResult,
    pub trial_frame_times: Vec<f64>,
}

impl WorkerReport {
    /// Keeps the lowest frame time; ties go to the earlier trial.
    pub fn from_trials(worker: usize, trials: Vec<TrialResult>) -> Option<Self> {
        let trial_frame_times = trials.iter().map(|trial| trial.frame_time).collect();
        let best = trials.into_iter().reduce(|best, trial| {
            if trial.frame_time < best.frame_time {
                trial
            } else {
                best
            }
        })?;
        Some(Self {
            worker,
            best,
            trial_frame_times,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub workers: usize,
    /// Sum of worker frame times.
    pub frame_time: f64,
    /// Sum of worker fps: combined throughput.
    pub fps: f64,
    /// Mean of worker wall-clock times; workers run concurrently so a sum
    /// would overstate elapsed time.
    pub total_time: f64,
}

impl AggregateReport {
    pub fn from_workers(reports: &[WorkerReport]) -> Option<Self> {
        if reports.is_empty() {
            return None;
        }
        let workers = reports.len();
        Some(Self {
            workers,
            frame_time: reports.iter().map(|r| r.best.frame_time).sum(),
            fps: reports.iter().map(|r| r.best.fps).sum(),
            total_time: reports.iter().map(|r| r.best.total_time).sum::<f64>() / workers as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkOutcome {
    pub aggregate: AggregateReport,
    pub workers: Vec<WorkerReport>,
}

/// Runs one worker per party and returns their reports in worker order.
pub trait WorkerPool {
    fn run(&self, settings: &BenchmarkSettings) -> Result<Vec<WorkerReport>, HarnessError>;
}

pub struct Harness<P: WorkerPool> {
    pool: P,
}

impl<P: WorkerPool> Harness<P> {
    pub fn new(pool: P) -> Self {
        Self { pool }
    }

    /// Fails as a whole if any worker fails; partial results are dropped.
    pub fn benchmark(&self, settings: &BenchmarkSettings) -> Result<BenchmarkOutcome, HarnessError> {
        settings.validate()?;
        info!(
            "benchmarking {} worker(s), {} frames x {} trials each",
            settings.num_processes, settings.max_frames, TRIALS
        );
        let mut workers = self.pool.run(settings)?;
        if workers.len() != settings.num_processes {
            return Err(HarnessError::Protocol(format!(
                "expected {} worker reports, got {}",
                settings.num_processes,
                workers.len()
            )));
        }
        workers.sort_by_key(|report| report.worker);
        let aggregate = AggregateReport::from_workers(&workers)
            .ok_or_else(|| HarnessError::Protocol("no worker reports".to_string()))?;
        Ok(BenchmarkOutcome { aggregate, workers })
    }
}

/// Worker body shared by every pool: build the simulator, run the trials,
/// always close the simulator.
pub fn run_worker<F, B>(
    factory: &F,
    settings: &BenchmarkSettings,
    worker: usize,
    barrier: &B,
) -> Result<WorkerReport>
where
    F: SimulatorFactory + ?Sized,
    B: Rendezvous + ?Sized,
{
    let mut sim = factory.create(settings, worker)?;
    let outcome = run_trials(sim.as_mut(), settings, worker, barrier);
    sim.close();
    outcome
}

fn run_trials<B: Rendezvous + ?Sized>(
    sim: &mut dyn Simulator,
    settings: &BenchmarkSettings,
    worker: usize,
    barrier: &B,
) -> Result<WorkerReport> {
    let mut rng = RngManager::new(settings.seed);
    let start = init_agent_state(sim, settings.default_agent, settings.start_height_threshold)?;
    debug!(
        "worker {worker}: start {:?} after {} samples",
        start.state.position, start.samples
    );

    let observers = prepare_observers(sim, settings)?;
    let mut step_loop = StepLoopBuilder::new(settings)
        .with_observers(observers)
        .build();
    let mut trials = Vec::with_capacity(TRIALS);
    for trial in 0..TRIALS {
        barrier.wait()?;
        if worker == 0 {
            barrier.reset()?;
        }
        let result = step_loop.run_trial(sim, &mut rng.stream("actions"))?;
        debug!(
            "worker {worker}: trial {trial} frame time {:.3} ms ({:.1} fps)",
            result.frame_time * 1000.0,
            result.fps
        );
        trials.push(result);
    }

    WorkerReport::from_trials(worker, trials)
        .ok_or_else(|| anyhow::anyhow!("worker {worker} ran no trials"))
}
