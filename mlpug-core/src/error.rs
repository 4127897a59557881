//! Error types for the mlpug-core crate.
//!
//! Configuration errors are fatal and raised while a run is being set up.
//! Compute errors are caught by the evaluator and only drop the failing metric.
//! Checkpoint I/O errors are surfaced to the caller and logged prominently.

use thiserror::Error;

/// Top-level error type for training orchestration.
#[derive(Debug, Error)]
pub enum MlpugError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metric '{metric}' failed to compute: {message}")]
    Compute { metric: String, message: String },

    #[error("Invalid key path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("Distributed value error: {0}")]
    Distributed(String),

    #[error("Checkpoint I/O error: {0}")]
    CheckpointIo(String),

    #[error("Callback '{callback}' failed in {hook}")]
    CallbackFailed { callback: String, hook: String },

    #[error("Trainer error: {0}")]
    Trainer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MlpugError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn compute(metric: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Compute {
            metric: metric.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn distributed(msg: impl Into<String>) -> Self {
        Self::Distributed(msg.into())
    }

    pub fn checkpoint_io(msg: impl Into<String>) -> Self {
        Self::CheckpointIo(msg.into())
    }

    pub fn trainer(msg: impl Into<String>) -> Self {
        Self::Trainer(msg.into())
    }

    /// Whether the error is a structural error that must terminate a run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidPath { .. } | Self::Distributed(_) | Self::CallbackFailed { .. }
        )
    }
}

pub type Result<T, E = MlpugError> = std::result::Result<T, E>;
