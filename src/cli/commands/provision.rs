//! `provision`: render tfvars and apply the Terraform configuration

use crate::cli::error::CliError;
use crate::config::PipelineConfig;
use crate::pipeline::{PipelineError, steps};

/// Provision command arguments
#[derive(Debug, Clone, Default)]
pub struct ProvisionArgs {
    /// Only write `terraform.tfvars`
    pub tfvars_only: bool,
}

pub fn handle_provision(args: &ProvisionArgs, config: &PipelineConfig) -> Result<(), CliError> {
    if args.tfvars_only {
        use crate::infra::terraform::{Terraform, TfVars, write_tfvars};

        let vars = TfVars::from_config(config)?;
        let terraform = Terraform::from_config(config).map_err(PipelineError::from)?;
        let path = write_tfvars(terraform.working_dir(), &vars).map_err(PipelineError::from)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    steps::provision(config)?;
    println!("PostgreSQL server provisioned.");
    Ok(())
}
