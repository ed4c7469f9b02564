use std::path::PathBuf;

use thiserror::Error;

/// Request-time failures of the supervisor. Run-time failures of the capture
/// process never surface here; they are recorded in the run status instead.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timelapse already running")]
    AlreadyRunning,

    #[error("No timelapse running")]
    NotRunning,

    #[error("Timelapse script not found or not executable: {}", .0.display())]
    ScriptUnavailable(PathBuf),

    #[error("Failed to spawn timelapse script: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Persistence failures of the status file.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Status path has no parent directory: {}", .0.display())]
    InvalidPath(PathBuf),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
