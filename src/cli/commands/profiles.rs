//! `profiles`: write dbt `profiles.yml`

use crate::cli::error::CliError;
use crate::config::PipelineConfig;
use crate::pipeline::steps;

pub fn handle_profiles(config: &PipelineConfig) -> Result<(), CliError> {
    let path = steps::generate_profiles(config)?;
    println!("Wrote {}", path.display());
    Ok(())
}
