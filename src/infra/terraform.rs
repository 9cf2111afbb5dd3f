//! Terraform driver and output reader

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{InfraError, InfraResult, ToolOutput, resolve_within_repo, run_tool};
use crate::config::{
    ConfigResult, ENV_AZURE_LOCATION, ENV_AZURE_RESOURCE_GROUP_NAME, ENV_AZURE_SUBSCRIPTION_ID,
    ENV_DB_PASSWORD, ENV_DB_USER, ENV_POSTGRES_SERVER_NAME, PipelineConfig, require,
};
use crate::database::ConnectionParams;

/// Variables file written next to the Terraform configuration
pub const TFVARS_FILE: &str = "terraform.tfvars";

/// Fallback output holding a full connection string
const CONN_STR_OUTPUT: &str = "postgres_example_conn_str";

/// Source of Terraform outputs
///
/// Implemented by [`Terraform`]; tests provide canned JSON.
pub trait OutputSource {
    fn load_outputs(&self) -> InfraResult<TerraformOutputs>;
}

/// Terraform invocation bound to one working directory
#[derive(Debug, Clone)]
pub struct Terraform {
    program: String,
    working_dir: PathBuf,
}

impl Terraform {
    pub fn new(program: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            working_dir,
        }
    }

    /// Bind to the configured Terraform directory
    ///
    /// The directory must exist and stay inside the repository root.
    pub fn from_config(config: &PipelineConfig) -> InfraResult<Self> {
        let working_dir =
            resolve_within_repo(&config.paths.repo_root, &config.paths.terraform_dir)?;
        Ok(Self::new(config.terraform.program.clone(), working_dir))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn init(&self) -> InfraResult<ToolOutput> {
        self.run(&["init"])
    }

    pub fn apply(&self) -> InfraResult<ToolOutput> {
        self.run(&["apply", "-auto-approve"])
    }

    /// `terraform output -json`, parsed
    pub fn output_json(&self) -> InfraResult<TerraformOutputs> {
        let output = self.run(&["output", "-json"])?;
        TerraformOutputs::parse(&output.stdout)
    }

    fn run(&self, args: &[&str]) -> InfraResult<ToolOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = run_tool(&self.program, &args, &self.working_dir)?;
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(target: "terraform", "{}", line);
        }
        Ok(output)
    }
}

impl OutputSource for Terraform {
    fn load_outputs(&self) -> InfraResult<TerraformOutputs> {
        self.output_json()
    }
}

/// Output source bound to the configured Terraform directory
///
/// Nothing is resolved until outputs are requested.
pub struct ConfiguredOutputs<'a> {
    config: &'a PipelineConfig,
}

impl<'a> ConfiguredOutputs<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }
}

impl OutputSource for ConfiguredOutputs<'_> {
    fn load_outputs(&self) -> InfraResult<TerraformOutputs> {
        Terraform::from_config(self.config)?.output_json()
    }
}

/// Parsed `terraform output -json` document
#[derive(Debug, Clone, Default)]
pub struct TerraformOutputs {
    values: BTreeMap<String, Value>,
}

impl TerraformOutputs {
    /// Parse the JSON document
    ///
    /// Entries may be `{"value": x, ...}` objects or bare values.
    pub fn parse(json: &str) -> InfraResult<Self> {
        let doc: Value = serde_json::from_str(json)
            .map_err(|e| InfraError::InvalidOutput(format!("terraform output: {}", e)))?;
        let Value::Object(map) = doc else {
            return Err(InfraError::InvalidOutput(
                "terraform output is not a JSON object".to_string(),
            ));
        };

        let values = map
            .into_iter()
            .map(|(key, entry)| {
                let value = match entry {
                    Value::Object(mut obj) if obj.contains_key("value") => {
                        obj.remove("value").unwrap_or(Value::Null)
                    }
                    other => other,
                };
                (key, value)
            })
            .collect();

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// String form of an output; numbers are rendered as text
    pub fn get_string(&self, key: &str) -> InfraResult<String> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(other) => Err(InfraError::InvalidOutput(format!(
                "{} is not a scalar: {}",
                key, other
            ))),
            None => Err(InfraError::MissingOutput(key.to_string())),
        }
    }

    pub fn get_port(&self, key: &str) -> InfraResult<u16> {
        let raw = self.get_string(key)?;
        raw.parse()
            .map_err(|_| InfraError::InvalidOutput(format!("{} is not a port: {}", key, raw)))
    }

    /// Connection parameters for the provisioned server
    ///
    /// Prefers the discrete `db_*` outputs and falls back to
    /// `postgres_example_conn_str` when `db_host` is absent. Only the
    /// address and credentials are taken from the connection string; an
    /// `sslmode` in it is ignored and `database.sslmode` applies.
    pub fn connection_params(&self, schema: &str) -> InfraResult<ConnectionParams> {
        if self.get("db_host").is_none()
            && let Some(conn_str) = self.get(CONN_STR_OUTPUT)
        {
            let conn_str = conn_str.as_str().ok_or_else(|| {
                InfraError::InvalidOutput(format!("{} is not a string", CONN_STR_OUTPUT))
            })?;
            return parse_connection_string(conn_str, schema);
        }

        Ok(ConnectionParams {
            host: self.get_string("db_host")?,
            port: self.get_port("db_port")?,
            user: self.get_string("db_user")?,
            password: self.get_string("db_password")?,
            dbname: self.get_string("db_name")?,
            schema: schema.to_string(),
        })
    }
}

fn parse_connection_string(conn_str: &str, schema: &str) -> InfraResult<ConnectionParams> {
    let invalid = |what: &str| InfraError::InvalidOutput(format!("{}: {}", CONN_STR_OUTPUT, what));

    let config: tokio_postgres::Config = conn_str.parse().map_err(|e| {
        InfraError::InvalidOutput(format!("{}: {}", CONN_STR_OUTPUT, e))
    })?;

    let host = config
        .get_hosts()
        .iter()
        .find_map(|h| match h {
            tokio_postgres::config::Host::Tcp(host) => Some(host.clone()),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(_) => None,
        })
        .ok_or_else(|| invalid("no TCP host"))?;
    let port = config.get_ports().first().copied().unwrap_or(5432);
    let user = config
        .get_user()
        .ok_or_else(|| invalid("no user"))?
        .to_string();
    let password = config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .ok_or_else(|| invalid("no password"))?;
    let dbname = config
        .get_dbname()
        .ok_or_else(|| invalid("no dbname"))?
        .to_string();

    Ok(ConnectionParams {
        host,
        port,
        user,
        password,
        dbname,
        schema: schema.to_string(),
    })
}

/// Input variables for the PostgreSQL server module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TfVars {
    pub subscription_id: String,
    pub resource_group_name: String,
    pub location: String,
    pub postgres_server_name: String,
    pub db_admin: String,
    pub db_password: String,
    pub allowed_ip_range: Option<String>,
    pub vm_name: Option<String>,
    pub ssh_public_key_path: Option<String>,
}

impl TfVars {
    pub fn from_config(config: &PipelineConfig) -> ConfigResult<Self> {
        let azure = &config.azure;
        let db = &config.database;
        Ok(Self {
            subscription_id: require(&azure.subscription_id, ENV_AZURE_SUBSCRIPTION_ID)?
                .to_string(),
            resource_group_name: require(&azure.resource_group, ENV_AZURE_RESOURCE_GROUP_NAME)?
                .to_string(),
            location: require(&azure.location, ENV_AZURE_LOCATION)?.to_string(),
            postgres_server_name: require(&azure.postgres_server_name, ENV_POSTGRES_SERVER_NAME)?
                .to_string(),
            db_admin: require(&db.user, ENV_DB_USER)?.to_string(),
            db_password: require(&db.password, ENV_DB_PASSWORD)?.to_string(),
            allowed_ip_range: azure.allowed_ip_range.clone(),
            vm_name: azure.vm_name.clone(),
            ssh_public_key_path: azure.ssh_public_key_path.clone(),
        })
    }

    /// HCL text, one `name = "value"` line per variable
    pub fn render(&self) -> String {
        let mut entries = vec![
            ("subscription_id", Some(&self.subscription_id)),
            ("resource_group_name", Some(&self.resource_group_name)),
            ("location", Some(&self.location)),
            ("postgres_server_name", Some(&self.postgres_server_name)),
            ("db_admin", Some(&self.db_admin)),
            ("db_password", Some(&self.db_password)),
        ];
        entries.push(("allowed_ip_range", self.allowed_ip_range.as_ref()));
        entries.push(("vm_name", self.vm_name.as_ref()));
        entries.push(("ssh_public_key_path", self.ssh_public_key_path.as_ref()));

        entries
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| format!("{} = \"{}\"\n", name, hcl_escape(v))))
            .collect()
    }
}

/// Write `terraform.tfvars` into `dir`, creating it if needed
pub fn write_tfvars(dir: &Path, vars: &TfVars) -> InfraResult<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| InfraError::Io(e.to_string()))?;
    let path = dir.join(TFVARS_FILE);
    std::fs::write(&path, vars.render()).map_err(|e| InfraError::Io(e.to_string()))?;
    tracing::info!("Wrote {}", path.display());
    Ok(path)
}

fn hcl_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' => out.push_str("$$"),
            '%' => out.push_str("%%"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use tempfile::tempdir;

    fn azure_config() -> PipelineConfig {
        let mut config = PipelineConfig::new();
        config.azure.subscription_id = Some("sub-1".to_string());
        config.azure.resource_group = Some("rg".to_string());
        config.azure.location = Some("francecentral".to_string());
        config.azure.postgres_server_name = Some("psql-degust".to_string());
        config.database.user = Some("admin".to_string());
        config.database.password = Some("p\"w$x".to_string());
        config
    }

    #[test]
    fn test_parse_value_objects_and_bare_values() {
        let outputs = TerraformOutputs::parse(
            r#"{"db_host": {"value": "h", "sensitive": false}, "db_port": 5432, "nothing": {"value": null}}"#,
        )
        .unwrap();
        assert_eq!(outputs.get_string("db_host").unwrap(), "h");
        assert_eq!(outputs.get_port("db_port").unwrap(), 5432);
        assert!(matches!(
            outputs.get_string("nothing"),
            Err(InfraError::MissingOutput(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            TerraformOutputs::parse("not json"),
            Err(InfraError::InvalidOutput(_))
        ));
        assert!(matches!(
            TerraformOutputs::parse("[1, 2]"),
            Err(InfraError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_connection_string_fallback() {
        let outputs = TerraformOutputs::parse(
            r#"{"postgres_example_conn_str": {"value": "host=psql.example.net port=5432 user=admin password=pw dbname=postgres sslmode=require"}}"#,
        )
        .unwrap();
        let params = outputs.connection_params("public").unwrap();
        assert_eq!(params.host, "psql.example.net");
        assert_eq!(params.port, 5432);
        assert_eq!(params.user, "admin");
        assert_eq!(params.password, "pw");
        assert_eq!(params.dbname, "postgres");
    }

    #[test]
    fn test_connection_string_sslmode_does_not_change_params() {
        let with_mode = |mode: &str| {
            let json = format!(
                r#"{{"postgres_example_conn_str": "host=h user=u password=p dbname=d sslmode={}"}}"#,
                mode
            );
            TerraformOutputs::parse(&json)
                .unwrap()
                .connection_params("public")
                .unwrap()
        };
        assert_eq!(with_mode("disable"), with_mode("require"));
    }

    #[test]
    fn test_bad_port_is_invalid_output() {
        let outputs = TerraformOutputs::parse(
            r#"{"db_host": "h", "db_port": "abc", "db_user": "u", "db_password": "p", "db_name": "d"}"#,
        )
        .unwrap();
        assert!(matches!(
            outputs.connection_params("public"),
            Err(InfraError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_tfvars_render_escapes() {
        let vars = TfVars::from_config(&azure_config()).unwrap();
        let text = vars.render();
        assert!(text.contains("subscription_id = \"sub-1\"\n"));
        assert!(text.contains("db_password = \"p\\\"w$$x\"\n"));
        assert!(!text.contains("vm_name"));
    }

    #[test]
    fn test_tfvars_missing_key() {
        let mut config = azure_config();
        config.azure.location = None;
        let err = TfVars::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref k) if k == "AZURE_LOCATION"));
    }

    #[test]
    fn test_write_tfvars_creates_dir() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("terraform");
        let vars = TfVars::from_config(&azure_config()).unwrap();
        let path = write_tfvars(&target, &vars).unwrap();
        assert_eq!(path, target.join(TFVARS_FILE));
        assert_eq!(std::fs::read_to_string(path).unwrap(), vars.render());
    }

    #[cfg(unix)]
    #[test]
    fn test_output_json_from_fake_terraform() {
        let dir = tempdir().unwrap();
        let script = crate::infra::tests::write_script(
            dir.path(),
            "terraform",
            r#"echo '{"db_host": {"value": "h"}, "db_port": {"value": 5432}, "db_user": {"value": "u"}, "db_password": {"value": "p"}, "db_name": {"value": "d"}}'"#,
        );
        let tf = Terraform::new(script.to_str().unwrap(), dir.path().to_path_buf());
        let params = tf.load_outputs().unwrap().connection_params("s").unwrap();
        assert_eq!(params.host, "h");
        assert_eq!(params.schema, "s");
    }

    #[cfg(unix)]
    #[test]
    fn test_output_json_tool_failure() {
        let dir = tempdir().unwrap();
        let script =
            crate::infra::tests::write_script(dir.path(), "terraform", "echo nope >&2; exit 1");
        let tf = Terraform::new(script.to_str().unwrap(), dir.path().to_path_buf());
        match tf.output_json().unwrap_err() {
            InfraError::ToolFailed { stderr, .. } => assert_eq!(stderr.trim(), "nope"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
