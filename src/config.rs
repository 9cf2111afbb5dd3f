//! Pipeline configuration
//!
//! Handles parsing of the `pipeline.toml` configuration file and
//! environment variable overrides. The resulting [`PipelineConfig`] is
//! built once at process start and passed to every component.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration filename
pub const CONFIG_FILENAME: &str = "pipeline.toml";

/// Environment variable selecting the provider mode
pub const ENV_DB_PROVIDER: &str = "DB_PROVIDER";
/// Environment variable for the database host (local mode)
pub const ENV_DB_HOST: &str = "DB_HOST";
/// Environment variable for the database port (local port in tunnel mode)
pub const ENV_DB_PORT: &str = "DB_PORT";
/// Environment variable for the database user
pub const ENV_DB_USER: &str = "DB_USER";
/// Environment variable for the database password
pub const ENV_DB_PASSWORD: &str = "DB_PASSWORD";
/// Environment variable for the database name
pub const ENV_DB_NAME: &str = "DB_NAME";
/// Environment variable for the destination schema
pub const ENV_DB_SCHEMA: &str = "DB_SCHEMA";
/// Environment variable for the PostgreSQL sslmode
pub const ENV_DB_SSLMODE: &str = "DB_SSLMODE";

pub const ENV_AZURE_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
pub const ENV_AZURE_RESOURCE_GROUP_NAME: &str = "AZURE_RESOURCE_GROUP_NAME";
pub const ENV_AZURE_LOCATION: &str = "AZURE_LOCATION";
pub const ENV_POSTGRES_SERVER_NAME: &str = "POSTGRES_SERVER_NAME";
pub const ENV_VM_NAME: &str = "VM_NAME";
pub const ENV_BASTION_NAME: &str = "BASTION_NAME";
pub const ENV_ALLOWED_IP_RANGE: &str = "ALLOWED_IP_RANGE";
pub const ENV_SSH_PUBLIC_KEY_PATH: &str = "SSH_PUBLIC_KEY_PATH";

/// Port used by a local PostgreSQL when `DB_PORT` is unset
pub const DEFAULT_LOCAL_PORT: u16 = 5432;
/// Local tunnel port used when `DB_PORT` is unset
pub const DEFAULT_TUNNEL_PORT: u16 = 5438;

/// Public export of the Pays de la Loire degustations dataset
pub const DEFAULT_DATASET_URL: &str = "https://data.paysdelaloire.fr/api/explore/v2.1/catalog/datasets/234400034_070-010_offre-touristique-degustations-rpdl/exports/csv?lang=fr&timezone=Europe%2FBerlin&use_labels=true&delimiter=%3B";

/// Error type for configuration loading and resolution
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required key is absent from both the file and the environment
    #[error("Missing required configuration key: {0}")]
    MissingKey(String),

    /// A key is present but its value cannot be used
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Provider mode outside `local`, `azure`, `azure_tunnel`
    #[error("Provider type is not supported: '{0}'. Use 'local', 'azure' or 'azure_tunnel'.")]
    UnsupportedProvider(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How database connection parameters are obtained for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// PostgreSQL reachable directly, parameters from configuration
    Local,
    /// Azure server reachable directly, parameters from Terraform outputs
    Azure,
    /// Azure server reached through a local Bastion tunnel
    AzureTunnel,
}

impl std::str::FromStr for ProviderMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(ProviderMode::Local),
            "azure" => Ok(ProviderMode::Azure),
            "azure_tunnel" => Ok(ProviderMode::AzureTunnel),
            _ => Err(ConfigError::UnsupportedProvider(s.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderMode::Local => write!(f, "local"),
            ProviderMode::Azure => write!(f, "azure"),
            ProviderMode::AzureTunnel => write!(f, "azure_tunnel"),
        }
    }
}

/// Table write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Drop the destination table and recreate it
    Replace,
    /// Add rows to the destination table, creating it if missing
    #[default]
    Append,
}

impl std::str::FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "replace" => Ok(WriteMode::Replace),
            "append" => Ok(WriteMode::Append),
            _ => Err(format!(
                "Unknown write mode: {}. Use 'replace' or 'append'.",
                s
            )),
        }
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Replace => write!(f, "replace"),
            WriteMode::Append => write!(f, "append"),
        }
    }
}

/// PostgreSQL TLS negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            _ => Err(format!(
                "Unknown sslmode: {}. Use 'disable', 'prefer' or 'require'.",
                s
            )),
        }
    }
}

/// Database section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Provider mode; required, from the file or `DB_PROVIDER`
    #[serde(default)]
    pub provider: Option<ProviderMode>,

    /// Host for local mode (defaults to `localhost`)
    #[serde(default)]
    pub host: Option<String>,

    /// Port for local mode, local tunnel port for tunnel mode
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    /// Destination schema
    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default)]
    pub sslmode: SslMode,
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            provider: None,
            host: None,
            port: None,
            user: None,
            password: None,
            name: None,
            schema: default_schema(),
            sslmode: SslMode::default(),
        }
    }
}

/// Azure identifiers used by provisioning and the Bastion tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureSection {
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub postgres_server_name: Option<String>,
    #[serde(default)]
    pub vm_name: Option<String>,
    /// CIDR range allowed through the server firewall
    #[serde(default)]
    pub allowed_ip_range: Option<String>,
    #[serde(default)]
    pub ssh_public_key_path: Option<String>,
}

/// Bastion tunnel section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Tunnel CLI program
    #[serde(default = "default_tunnel_program")]
    pub program: String,

    #[serde(default = "default_bastion_name")]
    pub bastion_name: String,

    /// Port of the database on the remote side
    #[serde(default = "default_resource_port")]
    pub resource_port: u16,

    #[serde(default = "default_local_host")]
    pub local_host: String,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Extra arguments appended to the tunnel command
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_tunnel_program() -> String {
    "az".to_string()
}

fn default_bastion_name() -> String {
    "bastion-host".to_string()
}

fn default_resource_port() -> u16 {
    5432
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_health_check_timeout() -> u64 {
    3
}

fn default_stop_grace() -> u64 {
    8
}

fn default_poll_interval() -> u64 {
    250
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            program: default_tunnel_program(),
            bastion_name: default_bastion_name(),
            resource_port: default_resource_port(),
            local_host: default_local_host(),
            startup_timeout_secs: default_startup_timeout(),
            health_check_timeout_secs: default_health_check_timeout(),
            stop_grace_secs: default_stop_grace(),
            poll_interval_ms: default_poll_interval(),
            extra_args: Vec::new(),
        }
    }
}

impl TunnelSection {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Filesystem layout, relative to the repository root unless absolute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,

    #[serde(default = "default_terraform_dir")]
    pub terraform_dir: PathBuf,

    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,

    #[serde(default = "default_dbt_dir")]
    pub dbt_project_dir: PathBuf,

    #[serde(default = "default_dbt_dir")]
    pub dbt_profiles_dir: PathBuf,
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_terraform_dir() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_data_file() -> PathBuf {
    PathBuf::from("data/degustations.csv")
}

fn default_dbt_dir() -> PathBuf {
    PathBuf::from("dbt/dbt_activities")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            terraform_dir: default_terraform_dir(),
            data_file: default_data_file(),
            dbt_project_dir: default_dbt_dir(),
            dbt_profiles_dir: default_dbt_dir(),
        }
    }
}

/// Source dataset and destination table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSection {
    #[serde(default = "default_dataset_url")]
    pub url: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    #[serde(default)]
    pub write_mode: WriteMode,

    /// Upper bound on rows per INSERT statement
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_dataset_url() -> String {
    DEFAULT_DATASET_URL.to_string()
}

fn default_table() -> String {
    "raw_degustation_data".to_string()
}

fn default_delimiter() -> char {
    ';'
}

fn default_batch_rows() -> usize {
    1000
}

fn default_chunk_size() -> usize {
    8192
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            url: default_dataset_url(),
            table: default_table(),
            delimiter: default_delimiter(),
            write_mode: WriteMode::default(),
            batch_rows: default_batch_rows(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// dbt project settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbtSection {
    #[serde(default = "default_dbt_program")]
    pub program: String,

    #[serde(default = "default_dbt_profile")]
    pub profile: String,

    #[serde(default = "default_dbt_target")]
    pub target: String,

    #[serde(default = "default_dbt_threads")]
    pub threads: u32,
}

fn default_dbt_program() -> String {
    "dbt".to_string()
}

fn default_dbt_profile() -> String {
    "dbt_activities".to_string()
}

fn default_dbt_target() -> String {
    "dev".to_string()
}

fn default_dbt_threads() -> u32 {
    1
}

impl Default for DbtSection {
    fn default() -> Self {
        Self {
            program: default_dbt_program(),
            profile: default_dbt_profile(),
            target: default_dbt_target(),
            threads: default_dbt_threads(),
        }
    }
}

/// Terraform settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerraformSection {
    #[serde(default = "default_terraform_program")]
    pub program: String,
}

fn default_terraform_program() -> String {
    "terraform".to_string()
}

impl Default for TerraformSection {
    fn default() -> Self {
        Self {
            program: default_terraform_program(),
        }
    }
}

/// Main configuration structure
///
/// Represents the `pipeline.toml` configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DatabaseSection,

    #[serde(default)]
    pub azure: AzureSection,

    #[serde(default)]
    pub tunnel: TunnelSection,

    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub dataset: DatasetSection,

    #[serde(default)]
    pub dbt: DbtSection,

    #[serde(default)]
    pub terraform: TerraformSection,
}

impl PipelineConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration for a repository
    ///
    /// Reads `pipeline.toml` from `repo_root` when present, then applies
    /// process environment overrides. The repository root recorded in the
    /// result is `repo_root` unless the file sets an absolute one.
    pub fn load(repo_root: &Path) -> ConfigResult<Self> {
        let config_path = repo_root.join(CONFIG_FILENAME);
        let mut config = Self::load_file(&config_path, repo_root)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from an explicit file path without env overrides
    pub fn load_file(config_path: &Path, repo_root: &Path) -> ConfigResult<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::Io(format!("Failed to read config: {}", e)))?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        if config.paths.repo_root.is_relative() {
            config.paths.repo_root = repo_root.join(&config.paths.repo_root);
        }

        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize config: {}", e)))
    }

    /// Apply process environment overrides
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Blank values count as unset. A value that cannot be parsed is an
    /// error naming the key.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(provider) = get(ENV_DB_PROVIDER) {
            self.database.provider = Some(provider.parse()?);
        }
        if let Some(host) = get(ENV_DB_HOST) {
            self.database.host = Some(host);
        }
        if let Some(port) = get(ENV_DB_PORT) {
            self.database.port = Some(parse_port(ENV_DB_PORT, &port)?);
        }
        if let Some(user) = get(ENV_DB_USER) {
            self.database.user = Some(user);
        }
        if let Some(password) = get(ENV_DB_PASSWORD) {
            self.database.password = Some(password);
        }
        if let Some(name) = get(ENV_DB_NAME) {
            self.database.name = Some(name);
        }
        if let Some(schema) = get(ENV_DB_SCHEMA) {
            self.database.schema = schema;
        }
        if let Some(sslmode) = get(ENV_DB_SSLMODE) {
            self.database.sslmode = sslmode.parse().map_err(|reason| ConfigError::InvalidValue {
                key: ENV_DB_SSLMODE.to_string(),
                value: sslmode.clone(),
                reason,
            })?;
        }

        let azure = &mut self.azure;
        for (key, slot) in [
            (ENV_AZURE_SUBSCRIPTION_ID, &mut azure.subscription_id),
            (ENV_AZURE_RESOURCE_GROUP_NAME, &mut azure.resource_group),
            (ENV_AZURE_LOCATION, &mut azure.location),
            (ENV_POSTGRES_SERVER_NAME, &mut azure.postgres_server_name),
            (ENV_VM_NAME, &mut azure.vm_name),
            (ENV_ALLOWED_IP_RANGE, &mut azure.allowed_ip_range),
            (ENV_SSH_PUBLIC_KEY_PATH, &mut azure.ssh_public_key_path),
        ] {
            if let Some(value) = get(key) {
                *slot = Some(value);
            }
        }

        if let Some(bastion) = get(ENV_BASTION_NAME) {
            self.tunnel.bastion_name = bastion;
        }

        Ok(())
    }

    /// The active provider mode
    pub fn provider(&self) -> ConfigResult<ProviderMode> {
        self.database
            .provider
            .ok_or_else(|| ConfigError::MissingKey(ENV_DB_PROVIDER.to_string()))
    }

    /// Port on which the tunnel exposes the remote database locally
    pub fn tunnel_local_port(&self) -> u16 {
        self.database.port.unwrap_or(DEFAULT_TUNNEL_PORT)
    }

    /// Resolve a configured path against the repository root
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.repo_root.join(path)
        }
    }

    pub fn data_file(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_file)
    }

    pub fn dbt_project_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.dbt_project_dir)
    }

    pub fn dbt_profiles_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.dbt_profiles_dir)
    }
}

/// Return a required value or a [`ConfigError::MissingKey`] naming `key`
pub fn require<'a>(value: &'a Option<String>, key: &str) -> ConfigResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn parse_port(key: &str, value: &str) -> ConfigResult<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a port number between 1 and 65535".to_string(),
        })
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# Degustation pipeline configuration
# Every value can be overridden through the environment (DB_PROVIDER, DB_PORT, ...).

[database]
# Provider mode: "local", "azure" or "azure_tunnel"
provider = "local"
# host = "localhost"
# port = 5432
# user = "postgres"
# name = "degustations"
schema = "public"
# sslmode: "disable", "prefer" (default) or "require"
sslmode = "prefer"

[azure]
# subscription_id = "00000000-0000-0000-0000-000000000000"
# resource_group = "rg-degustations"
# location = "westeurope"
# postgres_server_name = "psql-degustations"
# vm_name = "vm-jump"

[tunnel]
program = "az"
bastion_name = "bastion-host"
resource_port = 5432
local_host = "127.0.0.1"
startup_timeout_secs = 60
health_check_timeout_secs = 3
stop_grace_secs = 8

[paths]
terraform_dir = "terraform"
data_file = "data/degustations.csv"
dbt_project_dir = "dbt/dbt_activities"
dbt_profiles_dir = "dbt/dbt_activities"

[dataset]
table = "raw_degustation_data"
write_mode = "append"
batch_rows = 1000

[dbt]
profile = "dbt_activities"
target = "dev"
threads = 1
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::new();
        assert!(config.database.provider.is_none());
        assert_eq!(config.database.schema, "public");
        assert_eq!(config.tunnel.bastion_name, "bastion-host");
        assert_eq!(config.tunnel.startup_timeout(), Duration::from_secs(60));
        assert_eq!(config.tunnel.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.dataset.table, "raw_degustation_data");
        assert_eq!(config.dataset.write_mode, WriteMode::Append);
    }

    #[test]
    fn test_provider_mode_from_str() {
        assert_eq!("local".parse::<ProviderMode>().unwrap(), ProviderMode::Local);
        assert_eq!("azure".parse::<ProviderMode>().unwrap(), ProviderMode::Azure);
        assert_eq!(
            "AZURE_TUNNEL".parse::<ProviderMode>().unwrap(),
            ProviderMode::AzureTunnel
        );
        for bad in ["aws", "", "azure-tunnel", "tunnel"] {
            assert!(matches!(
                bad.parse::<ProviderMode>(),
                Err(ConfigError::UnsupportedProvider(_))
            ));
        }
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
provider = "azure_tunnel"
port = 6543
schema = "raw"

[tunnel]
bastion_name = "my-bastion"
extra_args = ["--debug"]

[dataset]
write_mode = "replace"
"#;
        let config = PipelineConfig::parse(toml).unwrap();
        assert_eq!(config.provider().unwrap(), ProviderMode::AzureTunnel);
        assert_eq!(config.tunnel_local_port(), 6543);
        assert_eq!(config.database.schema, "raw");
        assert_eq!(config.tunnel.extra_args, vec!["--debug".to_string()]);
        assert_eq!(config.dataset.write_mode, WriteMode::Replace);
    }

    #[test]
    fn test_unknown_provider_in_file_is_rejected() {
        let toml = "[database]\nprovider = \"gcp\"\n";
        assert!(PipelineConfig::parse(toml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::new();
        config
            .apply_overrides(lookup(&[
                ("DB_PROVIDER", "local"),
                ("DB_PORT", "5433"),
                ("DB_USER", "loader"),
                ("DB_NAME", "degustations"),
                ("AZURE_SUBSCRIPTION_ID", "sub"),
                ("BASTION_NAME", "jump"),
                ("DB_SCHEMA", "  "),
            ]))
            .unwrap();
        assert_eq!(config.provider().unwrap(), ProviderMode::Local);
        assert_eq!(config.database.port, Some(5433));
        assert_eq!(config.database.user.as_deref(), Some("loader"));
        assert_eq!(config.azure.subscription_id.as_deref(), Some("sub"));
        assert_eq!(config.tunnel.bastion_name, "jump");
        // blank values are ignored
        assert_eq!(config.database.schema, "public");
    }

    #[test]
    fn test_env_override_unknown_provider_fails() {
        let mut config = PipelineConfig::new();
        let err = config
            .apply_overrides(lookup(&[("DB_PROVIDER", "gcp")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedProvider(ref p) if p == "gcp"));
    }

    #[test]
    fn test_env_override_bad_port_names_key() {
        let mut config = PipelineConfig::new();
        let err = config
            .apply_overrides(lookup(&[("DB_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(err.to_string().contains("DB_PORT"));
    }

    #[test]
    fn test_missing_provider_names_key() {
        let config = PipelineConfig::new();
        let err = config.provider().unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref k) if k == "DB_PROVIDER"));
    }

    #[test]
    fn test_tunnel_port_default() {
        let config = PipelineConfig::new();
        assert_eq!(config.tunnel_local_port(), DEFAULT_TUNNEL_PORT);
    }

    #[test]
    fn test_load_joins_relative_paths_to_repo_root() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            "[paths]\ndata_file = \"in/raw.csv\"\n",
        )
        .unwrap();

        let config =
            PipelineConfig::load_file(&dir.path().join(CONFIG_FILENAME), dir.path()).unwrap();
        assert_eq!(config.data_file(), dir.path().join(".").join("in/raw.csv"));
    }

    #[test]
    fn test_require_reports_key() {
        let err = require(&None, ENV_DB_USER).unwrap_err();
        assert_eq!(err.to_string(), "Missing required configuration key: DB_USER");
        assert_eq!(require(&Some("x".to_string()), ENV_DB_USER).unwrap(), "x");
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = PipelineConfig::parse(sample_config()).unwrap();
        assert_eq!(config.provider().unwrap(), ProviderMode::Local);
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut config = PipelineConfig::new();
        config.database.provider = Some(ProviderMode::Azure);
        let text = config.to_toml().unwrap();
        let parsed = PipelineConfig::parse(&text).unwrap();
        assert_eq!(parsed.provider().unwrap(), ProviderMode::Azure);
    }
}
