use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Watch error on {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    #[error("File not ready after {attempts} attempts: {path}")]
    FileNotReady { path: PathBuf, attempts: u32 },

    #[error("Failed to decode image {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Failed to persist result {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    /// Cancellation is a graceful stop, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MonitorError::Cancelled)
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            MonitorError::Io(err) => matches!(
                err.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
                    | ErrorKind::TimedOut
                    | ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    /// Short label used for the failure-stage metric.
    pub fn stage(&self) -> &'static str {
        match self {
            MonitorError::Watch { .. } => "watch",
            MonitorError::FileNotReady { .. } => "stability",
            MonitorError::Decode { .. } => "decode",
            MonitorError::Inference(_) => "inference",
            MonitorError::Persistence { .. } => "persistence",
            MonitorError::Config(_) => "config",
            MonitorError::Cancelled => "cancelled",
            MonitorError::Io(_) => "io",
            MonitorError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for MonitorError {
    fn from(err: anyhow::Error) -> Self {
        MonitorError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for MonitorError {
    fn from(err: tokio::task::JoinError) -> Self {
        MonitorError::Internal(format!("Blocking task failed: {}", err))
    }
}
