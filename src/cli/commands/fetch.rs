//! `fetch`: download the dataset export

use std::path::PathBuf;

use crate::cli::error::CliError;
use crate::config::PipelineConfig;
use crate::pipeline::steps;

/// Fetch command arguments
#[derive(Debug, Clone, Default)]
pub struct FetchArgs {
    /// Override the export URL
    pub url: Option<String>,
    /// Override the destination file
    pub output: Option<PathBuf>,
}

pub fn handle_fetch(args: &FetchArgs, config: &PipelineConfig) -> Result<(), CliError> {
    let mut config = config.clone();
    if let Some(url) = &args.url {
        config.dataset.url = url.clone();
    }
    if let Some(output) = &args.output {
        config.paths.data_file = output.clone();
    }

    let report = steps::fetch_dataset(&config)?;
    println!("Saved {} bytes to {}", report.bytes, report.path.display());
    Ok(())
}
