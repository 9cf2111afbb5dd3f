//! dbt driver and profile generation

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{InfraError, InfraResult, ToolOutput, run_tool};
use crate::config::PipelineConfig;
use crate::database::ConnectionParams;

/// Profiles file name dbt looks for in `--profiles-dir`
pub const PROFILES_FILE: &str = "profiles.yml";

/// dbt subcommands the pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbtCommand {
    Build,
    Run,
}

impl DbtCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbtCommand::Build => "build",
            DbtCommand::Run => "run",
        }
    }
}

impl std::fmt::Display for DbtCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// dbt invocation bound to one project
#[derive(Debug, Clone)]
pub struct Dbt {
    program: String,
    project_dir: PathBuf,
    profiles_dir: PathBuf,
    target: String,
}

impl Dbt {
    pub fn new(
        program: impl Into<String>,
        project_dir: PathBuf,
        profiles_dir: PathBuf,
        target: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            project_dir,
            profiles_dir,
            target: target.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.dbt.program.clone(),
            config.dbt_project_dir(),
            config.dbt_profiles_dir(),
            config.dbt.target.clone(),
        )
    }

    /// Command-line arguments for `command`
    pub fn args(&self, command: DbtCommand, select: Option<&str>) -> Vec<String> {
        let mut args = vec![
            command.as_str().to_string(),
            "--project-dir".to_string(),
            self.project_dir.display().to_string(),
            "--profiles-dir".to_string(),
            self.profiles_dir.display().to_string(),
            "--target".to_string(),
            self.target.clone(),
        ];
        if let Some(select) = select {
            args.push("--select".to_string());
            args.push(select.to_string());
        }
        args
    }

    /// Run `command` in the project directory
    pub fn invoke(&self, command: DbtCommand, select: Option<&str>) -> InfraResult<ToolOutput> {
        if !self.project_dir.is_dir() {
            return Err(InfraError::NotADirectory(self.project_dir.clone()));
        }
        let output = run_tool(&self.program, &self.args(command, select), &self.project_dir)?;
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(target: "dbt", "{}", line);
        }
        Ok(output)
    }
}

#[derive(Debug, Serialize)]
struct Profile {
    target: String,
    outputs: BTreeMap<String, ProfileOutput>,
}

// Field order is the order written to profiles.yml.
#[derive(Debug, Serialize)]
struct ProfileOutput {
    #[serde(rename = "type")]
    kind: &'static str,
    host: String,
    user: String,
    password: String,
    port: u16,
    dbname: String,
    schema: String,
    threads: u32,
}

/// Render `profiles.yml` for a single postgres target
pub fn render_profiles(
    profile: &str,
    target: &str,
    threads: u32,
    params: &ConnectionParams,
) -> InfraResult<String> {
    let output = ProfileOutput {
        kind: "postgres",
        host: params.host.clone(),
        user: params.user.clone(),
        password: params.password.clone(),
        port: params.port,
        dbname: params.dbname.clone(),
        schema: params.schema.clone(),
        threads,
    };
    let mut profiles = BTreeMap::new();
    profiles.insert(
        profile.to_string(),
        Profile {
            target: target.to_string(),
            outputs: BTreeMap::from([(target.to_string(), output)]),
        },
    );

    serde_yaml::to_string(&profiles)
        .map_err(|e| InfraError::InvalidOutput(format!("profiles.yml: {}", e)))
}

/// Write `profiles.yml` into `dir`, creating it if needed
pub fn write_profiles(
    dir: &Path,
    profile: &str,
    target: &str,
    threads: u32,
    params: &ConnectionParams,
) -> InfraResult<PathBuf> {
    let yaml = render_profiles(profile, target, threads, params)?;
    std::fs::create_dir_all(dir).map_err(|e| InfraError::Io(e.to_string()))?;
    let path = dir.join(PROFILES_FILE);
    std::fs::write(&path, yaml).map_err(|e| InfraError::Io(e.to_string()))?;
    tracing::info!("Wrote dbt profiles to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "127.0.0.1".to_string(),
            port: 5438,
            user: "loader".to_string(),
            password: "pw".to_string(),
            dbname: "degustations".to_string(),
            schema: "public".to_string(),
        }
    }

    #[test]
    fn test_args_with_select() {
        let dbt = Dbt::new(
            "dbt",
            PathBuf::from("dbt/proj"),
            PathBuf::from("dbt/profiles"),
            "dev",
        );
        assert_eq!(
            dbt.args(DbtCommand::Build, Some("staging")),
            vec![
                "build",
                "--project-dir",
                "dbt/proj",
                "--profiles-dir",
                "dbt/profiles",
                "--target",
                "dev",
                "--select",
                "staging"
            ]
        );
        assert_eq!(dbt.args(DbtCommand::Run, None).len(), 7);
    }

    #[test]
    fn test_profiles_yaml_shape() {
        let yaml = render_profiles("dbt_activities", "dev", 1, &params()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let out = &doc["dbt_activities"]["outputs"]["dev"];
        assert_eq!(doc["dbt_activities"]["target"].as_str(), Some("dev"));
        assert_eq!(out["type"].as_str(), Some("postgres"));
        assert_eq!(out["port"].as_u64(), Some(5438));
        assert_eq!(out["threads"].as_u64(), Some(1));

        let type_at = yaml.find("type:").unwrap();
        let threads_at = yaml.find("threads:").unwrap();
        assert!(type_at < threads_at);
    }

    #[test]
    fn test_write_profiles_creates_dir() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("dbt").join("dbt_activities");
        let path = write_profiles(&target, "dbt_activities", "dev", 1, &params()).unwrap();
        assert!(path.ends_with(PROFILES_FILE));
        assert!(std::fs::read_to_string(path).unwrap().contains("dbname: degustations"));
    }

    #[test]
    fn test_invoke_missing_project_dir() {
        let dir = tempdir().unwrap();
        let dbt = Dbt::new(
            "dbt",
            dir.path().join("absent"),
            dir.path().to_path_buf(),
            "dev",
        );
        assert!(matches!(
            dbt.invoke(DbtCommand::Build, None),
            Err(InfraError::NotADirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_invoke_passes_arguments() {
        let dir = tempdir().unwrap();
        let script = crate::infra::tests::write_script(dir.path(), "dbt", "echo \"$@\"");
        let dbt = Dbt::new(
            script.to_str().unwrap(),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            "dev",
        );
        let output = dbt.invoke(DbtCommand::Run, None).unwrap();
        assert!(output.stdout.starts_with("run --project-dir"));
        assert!(output.stdout.trim_end().ends_with("--target dev"));
    }
}
