//! Launch configuration for the semantic-layer tool.
//!
//! The tool reads its project location from environment variables:
//! - `DBT_PROJECT_DIR`: dbt project directory (also the working directory)
//! - `DBT_PROFILES_DIR`: directory containing `profiles.yml`
//! - `DBT_PATH`: path to the dbt executable
//!
//! The same variables are honoured when they are set for this process and
//! the settings file leaves the corresponding field empty.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the dbt project directory.
pub const PROJECT_DIR_VAR: &str = "DBT_PROJECT_DIR";
/// Environment variable naming the profiles directory.
pub const PROFILES_DIR_VAR: &str = "DBT_PROFILES_DIR";
/// Environment variable naming the dbt executable.
pub const DBT_PATH_VAR: &str = "DBT_PATH";

/// Location of the semantic manifest relative to the project directory.
const SEMANTIC_MANIFEST: &[&str] = &["target", "semantic_manifest.json"];

/// Resolved configuration used to spawn the tool's server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    /// Executable that starts the server.
    pub command: String,
    /// Arguments for the server command.
    pub args: Vec<String>,
    /// dbt project directory.
    pub project_dir: PathBuf,
    /// dbt profiles directory.
    pub profiles_dir: PathBuf,
    /// dbt executable.
    pub dbt_path: PathBuf,
    /// Extra environment variables for the server process.
    pub env: Vec<(String, String)>,
    /// Run `dbt parse` before spawning when the manifest is missing.
    pub prepare_manifest: bool,
    /// Deadline for `dbt` CLI commands.
    pub cli_timeout: Duration,
    /// How long to wait for the process to exit after closing stdin.
    pub shutdown_grace: Duration,
}

impl ToolConfig {
    /// Config for a dbt MCP server launched with `python -m dbt_mcp.main`.
    pub fn dbt_mcp(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            command: "python".to_string(),
            args: vec!["-m".to_string(), "dbt_mcp.main".to_string()],
            profiles_dir: project_dir.clone(),
            project_dir,
            dbt_path: PathBuf::from("dbt"),
            env: Vec::new(),
            prepare_manifest: true,
            cli_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Override the server command and its arguments.
    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = command.into();
        self.args = args;
        self
    }

    /// Environment passed to the server process, project variables first.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (
                PROJECT_DIR_VAR.to_string(),
                self.project_dir.display().to_string(),
            ),
            (
                PROFILES_DIR_VAR.to_string(),
                self.profiles_dir.display().to_string(),
            ),
            (DBT_PATH_VAR.to_string(), self.dbt_path.display().to_string()),
        ];
        vars.extend(self.env.iter().cloned());
        vars
    }

    /// Path of the semantic manifest the tool generates.
    pub fn manifest_path(&self) -> PathBuf {
        manifest_path_in(&self.project_dir)
    }
}

/// Semantic manifest location for a project directory.
pub fn manifest_path_in(project_dir: &Path) -> PathBuf {
    SEMANTIC_MANIFEST
        .iter()
        .fold(project_dir.to_path_buf(), |path, part| path.join(part))
}

/// Read a non-empty environment variable.
pub(crate) fn env_path(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
