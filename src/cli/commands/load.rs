//! `load`: write the CSV file into PostgreSQL

use std::path::PathBuf;

use crate::cli::error::CliError;
use crate::config::{PipelineConfig, WriteMode};
use crate::pipeline::steps;

/// Load command arguments
#[derive(Debug, Clone, Default)]
pub struct LoadArgs {
    pub file: Option<PathBuf>,
    pub table: Option<String>,
    pub schema: Option<String>,
    pub mode: Option<WriteMode>,
    pub delimiter: Option<char>,
}

impl LoadArgs {
    /// Apply these arguments on top of `config`
    pub fn apply(&self, config: &PipelineConfig) -> Result<PipelineConfig, CliError> {
        let mut config = config.clone();
        if let Some(file) = &self.file {
            config.paths.data_file = file.clone();
        }
        if let Some(table) = &self.table {
            if table.trim().is_empty() {
                return Err(CliError::InvalidArgument(
                    "table name must not be empty".to_string(),
                ));
            }
            config.dataset.table = table.clone();
        }
        if let Some(schema) = &self.schema {
            config.database.schema = schema.clone();
        }
        if let Some(mode) = self.mode {
            config.dataset.write_mode = mode;
        }
        if let Some(delimiter) = self.delimiter {
            config.dataset.delimiter = delimiter;
        }
        Ok(config)
    }
}

pub fn handle_load(args: &LoadArgs, config: &PipelineConfig) -> Result<(), CliError> {
    let config = args.apply(config)?;
    let rows = steps::load_dataset(&config)?;
    println!(
        "Loaded {} rows into {}.{} ({})",
        rows, config.database.schema, config.dataset.table, config.dataset.write_mode
    );
    Ok(())
}
