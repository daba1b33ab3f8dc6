//! Error types for the transfer pipeline

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a [`TransferClient`](crate::transfer::TransferClient).
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

/// Pipeline error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path '{path}' is not under source root '{root}'")]
    OutsideSourceRoot { path: PathBuf, root: PathBuf },

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Worker pool is shut down")]
    PoolShutdown,
}

impl PipelineError {
    /// Whether this error is the result of cooperative cancellation rather
    /// than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::Transfer(TransferError::Cancelled)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;
