//! `config show` / `config sample`

use crate::cli::error::CliError;
use crate::config::{PipelineConfig, sample_config};

/// Print the effective configuration with the password masked
pub fn handle_config_show(config: &PipelineConfig) -> Result<(), CliError> {
    let mut shown = config.clone();
    if shown.database.password.is_some() {
        shown.database.password = Some("****".to_string());
    }
    print!("{}", shown.to_toml()?);
    Ok(())
}

pub fn handle_config_sample() -> Result<(), CliError> {
    print!("{}", sample_config());
    Ok(())
}
