//! CLI-specific error types

use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use thiserror::Error;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tunnel health check failed on {0}")]
    Unhealthy(String),

    #[error("IO error: {0}")]
    IoError(String),
}
