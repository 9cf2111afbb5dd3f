//! Concrete pipeline steps
//!
//! Each step takes the run's [`PipelineConfig`] and is usable on its own
//! (the CLI calls them directly) or through [`PipelineRunner`].

use crate::config::{PipelineConfig, ProviderMode};
use crate::database::{
    ConnectionParams, DatabaseError, DatabaseResult, PostgresSink, resolve_connection,
    write_dataset,
};
use crate::fetch::{DownloadReport, download_csv};
use crate::infra::dbt::write_profiles;
use crate::infra::terraform::{TfVars, write_tfvars};
use crate::infra::{ConfiguredOutputs, Dbt, DbtCommand, Terraform, ToolOutput};
use crate::load::{Dataset, read_csv};
use crate::tunnel::{TunnelConfig, TunnelManager};

use super::{AssetKey, AssetRunner, PipelineError, PipelineResult};

/// Write `terraform.tfvars`, then `terraform init` and `apply`
pub fn provision(config: &PipelineConfig) -> PipelineResult<ToolOutput> {
    let vars = TfVars::from_config(config)?;
    let terraform = Terraform::from_config(config)?;
    write_tfvars(terraform.working_dir(), &vars)?;
    terraform.init()?;
    Ok(terraform.apply()?)
}

/// Download the configured dataset to the data file
pub fn fetch_dataset(config: &PipelineConfig) -> PipelineResult<DownloadReport> {
    Ok(download_csv(
        &config.dataset.url,
        &config.data_file(),
        config.dataset.chunk_size,
    )?)
}

/// Read the data file and write it to the configured table
///
/// An empty file is rejected before any connection is attempted.
///
/// # Returns
/// Number of rows inserted
pub fn load_dataset(config: &PipelineConfig) -> PipelineResult<u64> {
    let dataset = read_csv(config.data_file(), config.dataset.delimiter)?;
    if dataset.is_empty() {
        return Err(DatabaseError::EmptyDataset.into());
    }
    let params = resolve_connection(config, &ConfiguredOutputs::new(config))?;

    with_database_access(config, || {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| PipelineError::Runtime(format!("Failed to create runtime: {}", e)))?;
        let rows = rt.block_on(write_to_postgres(config, &params, &dataset))?;
        Ok(rows)
    })
}

async fn write_to_postgres(
    config: &PipelineConfig,
    params: &ConnectionParams,
    dataset: &Dataset,
) -> DatabaseResult<u64> {
    let sink = PostgresSink::connect(params, config.database.sslmode)
        .await?
        .with_batch_rows(config.dataset.batch_rows);
    write_dataset(
        &sink,
        dataset,
        &config.dataset.table,
        Some(&params.schema),
        config.dataset.write_mode,
    )
    .await
}

/// Write `profiles.yml` for the active provider
pub fn generate_profiles(config: &PipelineConfig) -> PipelineResult<std::path::PathBuf> {
    let params = resolve_connection(config, &ConfiguredOutputs::new(config))?;
    Ok(write_profiles(
        &config.dbt_profiles_dir(),
        &config.dbt.profile,
        &config.dbt.target,
        config.dbt.threads,
        &params,
    )?)
}

/// Run dbt against the configured project
pub fn run_dbt(
    config: &PipelineConfig,
    command: DbtCommand,
    select: Option<&str>,
) -> PipelineResult<ToolOutput> {
    let dbt = Dbt::from_config(config);
    with_database_access(config, || Ok(dbt.invoke(command, select)?))
}

/// Open the tunnel, probe its port once, and close it again
pub fn check_tunnel(config: &PipelineConfig) -> PipelineResult<bool> {
    let mut manager = TunnelManager::new(TunnelConfig::from_config(config)?);
    let session = manager.open()?;
    let healthy = session.health_check();
    session.close()?;
    Ok(healthy)
}

/// Run `f` with the database reachable
///
/// In `azure_tunnel` mode the tunnel is held open for the duration of `f`.
pub fn with_database_access<T, F>(config: &PipelineConfig, f: F) -> PipelineResult<T>
where
    F: FnOnce() -> PipelineResult<T>,
{
    match config.provider()? {
        ProviderMode::Local | ProviderMode::Azure => f(),
        ProviderMode::AzureTunnel => {
            let mut manager = TunnelManager::new(TunnelConfig::from_config(config)?);
            manager.with_tunnel(|_| f())
        }
    }
}

/// [`AssetRunner`] that performs the real steps
pub struct PipelineRunner {
    config: PipelineConfig,
}

impl PipelineRunner {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl AssetRunner for PipelineRunner {
    fn materialize(&mut self, asset: AssetKey) -> PipelineResult<String> {
        let config = &self.config;
        match asset {
            AssetKey::AzurePsqlServer => {
                provision(config)?;
                Ok("terraform apply complete".to_string())
            }
            AssetKey::RawData => {
                let report = fetch_dataset(config)?;
                Ok(format!("{} bytes -> {}", report.bytes, report.path.display()))
            }
            AssetKey::LoadedData => {
                let rows = load_dataset(config)?;
                Ok(format!(
                    "{} rows -> {}.{}",
                    rows, config.database.schema, config.dataset.table
                ))
            }
            AssetKey::DbtProfiles => {
                let path = generate_profiles(config)?;
                Ok(format!("wrote {}", path.display()))
            }
            AssetKey::DbtModels => {
                run_dbt(config, DbtCommand::Build, None)?;
                Ok("dbt build complete".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadError;
    use tempfile::tempdir;

    fn local_config(root: &std::path::Path) -> PipelineConfig {
        let mut config = PipelineConfig::new();
        config.paths.repo_root = root.to_path_buf();
        config.database.provider = Some(ProviderMode::Local);
        config.database.user = Some("loader".to_string());
        config.database.password = Some("pw".to_string());
        config.database.name = Some("degustations".to_string());
        config
    }

    #[test]
    fn test_generate_profiles_local() {
        let dir = tempdir().unwrap();
        let config = local_config(dir.path());
        let path = generate_profiles(&config).unwrap();
        assert_eq!(path, dir.path().join("dbt/dbt_activities/profiles.yml"));
        let yaml = std::fs::read_to_string(path).unwrap();
        assert!(yaml.contains("host: localhost"));
        assert!(yaml.contains("port: 5432"));
    }

    #[test]
    fn test_load_missing_file_fails_before_connecting() {
        let dir = tempdir().unwrap();
        let err = load_dataset(&local_config(dir.path())).unwrap_err();
        assert!(matches!(err, PipelineError::Load(LoadError::FileNotFound(_))));
    }

    #[test]
    fn test_header_only_csv_is_rejected_without_connecting() {
        let dir = tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();

        let mut config = local_config(dir.path());
        config.database.host = Some("127.0.0.1".to_string());
        config.database.port = Some(listener.local_addr().unwrap().port());
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(config.data_file(), "col1;col2\n").unwrap();

        let err = load_dataset(&config).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Database(DatabaseError::EmptyDataset)
        ));
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_provision_requires_azure_keys() {
        let dir = tempdir().unwrap();
        let err = provision(&local_config(dir.path())).unwrap_err();
        assert!(err.to_string().contains("AZURE_SUBSCRIPTION_ID"));
    }

    #[test]
    fn test_database_access_without_provider() {
        let dir = tempdir().unwrap();
        let mut config = local_config(dir.path());
        config.database.provider = None;
        let err = with_database_access(&config, || Ok(())).unwrap_err();
        assert!(err.to_string().contains("DB_PROVIDER"));
    }
}
