//! External tool invocation
//!
//! Thin wrappers around the command-line tools the pipeline drives:
//! Terraform for provisioning and infrastructure outputs, dbt for
//! transformations. Every invocation captures stdout and stderr so that a
//! failure can be reported with the tool's own output.

pub mod dbt;
pub mod terraform;

use std::path::{Path, PathBuf};
use std::process::Command;

pub use dbt::{Dbt, DbtCommand};
pub use terraform::{ConfiguredOutputs, OutputSource, Terraform, TerraformOutputs};

/// Error type for external tool operations
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// Program is not on `PATH`
    #[error("'{0}' not found in PATH (required).")]
    ToolNotFound(String),

    /// Program could not be started
    #[error("Failed to run {command}: {message}")]
    Spawn { command: String, message: String },

    /// Program exited unsuccessfully
    #[error("{command} failed with exit status {status}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    ToolFailed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    /// Tool output is not the expected structured data
    #[error("Invalid tool output: {0}")]
    InvalidOutput(String),

    /// A named output is absent
    #[error("Missing key in terraform outputs: {0}")]
    MissingOutput(String),

    /// Working directory resolved outside the repository
    #[error("{path} resolved outside repository root {root}")]
    OutsideRepository { path: PathBuf, root: PathBuf },

    /// Working directory does not exist or is not a directory
    #[error("{0} does not exist")]
    NotADirectory(PathBuf),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for tool operations
pub type InfraResult<T> = Result<T, InfraError>;

/// Captured output of a successful tool run
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Locate an executable the way a shell would
///
/// Names containing a path separator are checked as given; bare names are
/// searched on `PATH`.
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Run a tool to completion in `cwd`, capturing its output
///
/// Fails with [`InfraError::ToolNotFound`] when the program is missing and
/// with [`InfraError::ToolFailed`] on a nonzero exit.
pub fn run_tool(program: &str, args: &[String], cwd: &Path) -> InfraResult<ToolOutput> {
    let command = format!("{} {}", program, args.join(" "));
    let executable =
        find_executable(program).ok_or_else(|| InfraError::ToolNotFound(program.to_string()))?;

    tracing::info!("Running `{}` in {}", command.trim_end(), cwd.display());
    let output = Command::new(&executable)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| InfraError::Spawn {
            command: command.clone(),
            message: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(InfraError::ToolFailed {
            command,
            status: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stdout,
            stderr,
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

/// Resolve `relative` under `repo_root`, refusing anything outside it
///
/// Both paths are canonicalized, so `..` segments and symlinks cannot
/// escape the repository. The result must be an existing directory.
pub fn resolve_within_repo(repo_root: &Path, relative: &Path) -> InfraResult<PathBuf> {
    let root = repo_root
        .canonicalize()
        .map_err(|_| InfraError::NotADirectory(repo_root.to_path_buf()))?;
    let joined = root.join(relative);
    let resolved = joined
        .canonicalize()
        .map_err(|_| InfraError::NotADirectory(joined.clone()))?;

    if !resolved.starts_with(&root) {
        return Err(InfraError::OutsideRepository {
            path: resolved,
            root,
        });
    }
    if !resolved.is_dir() {
        return Err(InfraError::NotADirectory(resolved));
    }

    Ok(resolved)
}
