//! Degustation pipeline - provision, fetch, load and transform
//!
//! Provides:
//! - Configuration resolution for the `local`, `azure` and `azure_tunnel` provider modes
//! - Terraform and dbt drivers
//! - An Azure Bastion tunnel manager with scoped sessions
//! - CSV download and loading into PostgreSQL
//! - Asset and job definitions that sequence these steps

pub mod config;
pub mod database;
pub mod fetch;
pub mod infra;
pub mod load;
pub mod pipeline;
pub mod tunnel;

#[cfg(feature = "cli")]
pub mod cli;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig, ProviderMode, WriteMode};
pub use database::{
    ConnectionParams, DatabaseError, PostgresSink, TableRef, TableSink, resolve_connection,
    write_dataset,
};
pub use fetch::{DownloadReport, FetchError, download_csv};
pub use infra::{Dbt, DbtCommand, InfraError, OutputSource, Terraform, TerraformOutputs};
pub use load::{Dataset, LoadError, read_csv};
pub use pipeline::{
    AssetKey, AssetRunner, JobDefinition, JobReport, PipelineError, PipelineRunner, run_job,
};
pub use tunnel::{TunnelConfig, TunnelError, TunnelManager, TunnelSession, TunnelState};
