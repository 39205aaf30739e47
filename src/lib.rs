pub mod barrier;
pub mod config;
pub mod error;
pub mod frame;
pub mod harness;
pub mod observers;
pub mod report;
pub mod rng;
pub mod runner;
pub mod sim;

pub use config::{BenchmarkSettings, SettingsLoader};
pub use error::{BarrierError, HarnessError, SettingsError, SimError};
pub use frame::{FrameConverter, Pose};
pub use harness::{AggregateReport, BenchmarkOutcome, Harness, ProcessPool, ThreadPool, WorkerReport};
pub use runner::{run_example, StepLoop, StepLoopBuilder, TrialResult};
