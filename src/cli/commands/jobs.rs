//! `job run` / `job list`

use crate::cli::error::CliError;
use crate::config::PipelineConfig;
use crate::pipeline::{PipelineRunner, find_job, jobs, run_job};

/// Job run arguments
#[derive(Debug, Clone)]
pub struct JobRunArgs {
    pub name: String,
    /// Print the run report as JSON
    pub json: bool,
}

pub fn handle_job_run(args: &JobRunArgs, config: &PipelineConfig) -> Result<(), CliError> {
    let job = find_job(&args.name)?;
    let mut runner = PipelineRunner::new(config.clone());
    let report = run_job(job, &mut runner)?;

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::IoError(format!("Failed to serialize report: {}", e)))?;
        println!("{}", json);
    } else {
        println!("Run {} of {} succeeded", report.run_id, report.job);
        for m in &report.materialized {
            println!("  {:<18} {}", m.asset.name(), m.detail);
        }
    }
    Ok(())
}

pub fn handle_job_list() -> Result<(), CliError> {
    print!("{}", job_listing());
    Ok(())
}

/// One line per job followed by one line per selected asset
pub fn job_listing() -> String {
    let mut out = String::new();
    for job in jobs() {
        out.push_str(&format!("{:<18} {}\n", job.name, job.description));
        for asset in job.selection {
            out.push_str(&format!("  {:<16} {}\n", asset.name(), asset.description()));
        }
    }
    out
}
