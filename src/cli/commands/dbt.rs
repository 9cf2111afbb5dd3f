//! `dbt build` / `dbt run`

use crate::cli::error::CliError;
use crate::config::PipelineConfig;
use crate::infra::DbtCommand;
use crate::pipeline::steps;

/// dbt command arguments
#[derive(Debug, Clone)]
pub struct DbtArgs {
    pub command: DbtCommand,
    /// Node selector passed as `--select`
    pub select: Option<String>,
}

pub fn handle_dbt(args: &DbtArgs, config: &PipelineConfig) -> Result<(), CliError> {
    let output = steps::run_dbt(config, args.command, args.select.as_deref())?;
    print!("{}", output.stdout);
    Ok(())
}
