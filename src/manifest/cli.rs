//! Bounded `dbt` command runner.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{ToolConfig, PROFILES_DIR_VAR};

/// Errors from running the dbt executable.
#[derive(Error, Debug)]
pub enum CliError {
    /// The executable could not be started.
    #[error("failed to run {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command did not finish before the deadline.
    #[error("`dbt {command}` timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    /// The command ran and exited unsuccessfully.
    #[error("`dbt {command}` failed: {message}")]
    CommandFailed { command: String, message: String },
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turn an unsuccessful run into an error, preferring stderr for the message.
    pub fn into_result(self, command: &str) -> Result<Self, CliError> {
        if self.success {
            return Ok(self);
        }
        let message = match (self.stderr.trim(), self.stdout.trim()) {
            ("", "") => format!("exit code {:?}", self.code),
            ("", out) => out.to_string(),
            (err, _) => err.to_string(),
        };
        Err(CliError::CommandFailed {
            command: command.to_string(),
            message,
        })
    }
}

/// Runs the dbt executable inside a project directory.
#[derive(Debug, Clone)]
pub struct DbtCli {
    program: PathBuf,
    project_dir: PathBuf,
    profiles_dir: PathBuf,
    timeout: Duration,
}

impl DbtCli {
    pub fn new(
        program: impl Into<PathBuf>,
        project_dir: impl Into<PathBuf>,
        profiles_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            project_dir: project_dir.into(),
            profiles_dir: profiles_dir.into(),
            timeout,
        }
    }

    /// Build a runner from the tool's launch configuration.
    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(
            &config.dbt_path,
            &config.project_dir,
            &config.profiles_dir,
            config.cli_timeout,
        )
    }

    /// Semantic manifest path for this project.
    pub fn manifest_path(&self) -> PathBuf {
        crate::config::manifest_path_in(&self.project_dir)
    }

    /// Run `dbt <args>` and capture its output.
    ///
    /// A non-zero exit is reported in [`CommandOutput::success`], not as an error.
    /// The child is killed if the deadline passes.
    pub async fn run(&self, args: &[&str]) -> Result<CommandOutput, CliError> {
        let command = args.join(" ");
        debug!(program = %self.program.display(), %command, "running dbt");

        let child = Command::new(&self.program)
            .args(args)
            .current_dir(&self.project_dir)
            .env(PROFILES_DIR_VAR, &self.profiles_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CliError::SpawnFailed {
                program: self.program.display().to_string(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CliError::Timeout {
                command: command.clone(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|source| CliError::SpawnFailed {
                program: self.program.display().to_string(),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run `dbt parse --quiet`, generating the semantic manifest.
    pub async fn parse(&self) -> Result<CommandOutput, CliError> {
        let output = self.run(&["parse", "--quiet"]).await?;
        output.into_result("parse")
    }

    /// Parse only when the semantic manifest is missing.
    ///
    /// Returns `true` when a parse ran.
    pub async fn ensure_manifest(&self) -> Result<bool, CliError> {
        let path = self.manifest_path();
        if path.exists() {
            debug!(path = %path.display(), "semantic manifest present");
            return Ok(false);
        }
        info!(path = %path.display(), "semantic manifest missing, running dbt parse");
        self.parse().await?;
        Ok(true)
    }
}
