//! Error types for the ferry binary crate

use ferry_pipeline::PipelineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FerryError>;
