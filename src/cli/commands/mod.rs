//! CLI command implementations

pub mod config;
pub mod dbt;
pub mod fetch;
pub mod jobs;
pub mod load;
pub mod profiles;
pub mod provision;
pub mod tunnel;

use std::path::Path;

use crate::cli::error::CliError;
use crate::config::{CONFIG_FILENAME, PipelineConfig};

/// Build the run's configuration
///
/// Reads `config_path` (default `<repo_root>/pipeline.toml`) when it exists,
/// then applies environment overrides.
pub fn load_config(repo_root: &Path, config_path: Option<&Path>) -> Result<PipelineConfig, CliError> {
    let default_path = repo_root.join(CONFIG_FILENAME);
    let path = config_path.unwrap_or(default_path.as_path());
    if config_path.is_some() && !path.exists() {
        return Err(CliError::InvalidArgument(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let mut config = PipelineConfig::load_file(path, repo_root)?;
    config.apply_env_overrides()?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
