use std::thread;

use log::error;

use crate::barrier::LocalBarrier;
use crate::config::BenchmarkSettings;
use crate::error::{BarrierError, HarnessError};
use crate::sim::SimulatorFactory;

use super::{run_worker, WorkerPool, WorkerReport};

/// Runs every worker on its own thread of the current process.
///
/// Only suitable for simulators that tolerate several instances per
/// process; [`super::ProcessPool`] is the isolated alternative.
pub struct ThreadPool<F> {
    factory: F,
}

impl<F: SimulatorFactory> ThreadPool<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

/// Breaks the barrier unless disarmed, including while unwinding from a
/// panicking worker, so siblings are never left waiting.
struct AbortOnFailure<'a> {
    barrier: &'a LocalBarrier,
    armed: bool,
}

impl Drop for AbortOnFailure<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.barrier.abort();
        }
    }
}

impl<F: SimulatorFactory> WorkerPool for ThreadPool<F> {
    fn run(&self, settings: &BenchmarkSettings) -> Result<Vec<WorkerReport>, HarnessError> {
        settings.validate()?;
        let parties = settings.num_processes;
        let barrier = LocalBarrier::new(parties, settings.barrier_timeout());

        let outcomes: Vec<Result<WorkerReport, anyhow::Error>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..parties)
                .map(|worker| {
                    let barrier = &barrier;
                    let factory = &self.factory;
                    // Each worker gets its own copy of the settings.
                    let settings = settings.clone();
                    scope.spawn(move || {
                        let mut guard = AbortOnFailure {
                            barrier,
                            armed: true,
                        };
                        let outcome = run_worker(factory, &settings, worker, barrier);
                        guard.armed = outcome.is_err();
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("worker thread panicked")))
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(parties);
        let mut failures = Vec::new();
        for (worker, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!("worker {worker} failed: {err:#}");
                    failures.push((worker, err));
                }
            }
        }
        if failures.is_empty() {
            return Ok(reports);
        }

        // Report the worker that broke the barrier, not the ones it woke.
        let position = failures
            .iter()
            .position(|(_, err)| err.downcast_ref::<BarrierError>() != Some(&BarrierError::Broken))
            .unwrap_or(0);
        let (worker, err) = failures.swap_remove(position);
        Err(HarnessError::WorkerFailed {
            index: worker,
            message: format!("{err:#}"),
        })
    }
}
