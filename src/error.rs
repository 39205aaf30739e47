use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a simulator backend.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to load scene {path}: {message}")]
    SceneLoad { path: PathBuf, message: String },
    #[error("physics config file {0} not found")]
    PhysicsConfig(PathBuf),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("unknown agent id {0}")]
    UnknownAgent(usize),
    #[error("simulator has been closed")]
    Closed,
    #[error("simulator io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BarrierError {
    #[error("barrier broken by another party")]
    Broken,
    #[error("barrier wait timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("worker {index} failed: {message}")]
    WorkerFailed { index: usize, message: String },
    #[error("failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("worker coordinator runtime failed: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("worker protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}
