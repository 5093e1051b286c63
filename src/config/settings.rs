//! TOML-based configuration for headless-bi.
//!
//! Supports a config file (headless-bi.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [tool]
//! command = "python"
//! args = ["-m", "dbt_mcp.main"]
//! project_dir = "${HOME}/metrics/jaffle_shop"
//! dbt_path = "/usr/local/bin/dbt"
//! handshake_timeout_secs = 900
//!
//! [tool.env]
//! DBT_TARGET = "prod"
//!
//! [verbs]
//! metrics_namespace = "metricflow"
//! catalog_namespace = "dbt"
//!
//! [query]
//! filter_style = "templated"
//! default_limit = 100
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//! connect = "lazy"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::tool::{env_path, ToolConfig, DBT_PATH_VAR, PROFILES_DIR_VAR, PROJECT_DIR_VAR};
use crate::filter::FilterStyle;
use crate::tool::{ClientConfig, VerbNames};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "HEADLESS_BI_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// How to launch the semantic-layer tool.
    pub tool: ToolSettings,

    /// Verb names as the tool spells them.
    pub verbs: VerbNames,

    /// Query shaping.
    pub query: QuerySettings,

    /// HTTP server.
    pub server: ServerSettings,
}

/// Tool launch settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Executable that starts the MCP server.
    pub command: String,

    /// Arguments for the command.
    pub args: Vec<String>,

    /// dbt project directory (falls back to `DBT_PROJECT_DIR`, then `.`).
    pub project_dir: Option<String>,

    /// dbt profiles directory (falls back to `DBT_PROFILES_DIR`, then the project directory).
    pub profiles_dir: Option<String>,

    /// dbt executable (falls back to `DBT_PATH`, then `dbt` on PATH).
    pub dbt_path: Option<String>,

    /// Extra environment for the server process (values support ${ENV_VAR}).
    pub env: BTreeMap<String, String>,

    /// Deadline for the whole spawn + handshake sequence.
    pub handshake_timeout_secs: u64,

    /// Run `dbt parse` first when the semantic manifest is missing.
    pub prepare_manifest: bool,

    /// Deadline for dbt CLI commands.
    pub cli_timeout_secs: u64,

    /// Grace period for the server to exit after its stdin is closed.
    pub shutdown_grace_secs: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            command: "python".to_string(),
            args: vec!["-m".to_string(), "dbt_mcp.main".to_string()],
            project_dir: None,
            profiles_dir: None,
            dbt_path: None,
            env: BTreeMap::new(),
            // First run parses the whole project; that can take many minutes
            handshake_timeout_secs: 900,
            prepare_manifest: true,
            cli_timeout_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl ToolSettings {
    /// Resolve settings, environment fallbacks and `${VAR}` references into a launch config.
    pub fn resolve(&self) -> Result<ToolConfig, SettingsError> {
        let project_dir = resolve_field(self.project_dir.as_deref(), PROJECT_DIR_VAR)?
            .unwrap_or_else(|| ".".to_string());
        let profiles_dir = resolve_field(self.profiles_dir.as_deref(), PROFILES_DIR_VAR)?
            .unwrap_or_else(|| project_dir.clone());
        let dbt_path = resolve_field(self.dbt_path.as_deref(), DBT_PATH_VAR)?
            .unwrap_or_else(|| "dbt".to_string());

        if self.command.trim().is_empty() {
            return Err(SettingsError::InvalidConfig(
                "tool.command must not be empty".to_string(),
            ));
        }

        let env = self
            .env
            .iter()
            .map(|(key, value)| Ok((key.clone(), expand_env_vars(value)?)))
            .collect::<Result<Vec<_>, SettingsError>>()?;

        Ok(ToolConfig {
            command: expand_env_vars(&self.command)?,
            args: self
                .args
                .iter()
                .map(|arg| expand_env_vars(arg))
                .collect::<Result<_, _>>()?,
            project_dir: PathBuf::from(project_dir),
            profiles_dir: PathBuf::from(profiles_dir),
            dbt_path: PathBuf::from(dbt_path),
            env,
            prepare_manifest: self.prepare_manifest,
            cli_timeout: Duration::from_secs(self.cli_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        })
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn resolve_field(value: Option<&str>, var: &str) -> Result<Option<String>, SettingsError> {
    match value {
        Some(v) if !v.trim().is_empty() => expand_env_vars(v).map(Some),
        _ => Ok(env_path(var)),
    }
}

/// Query shaping settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuerySettings {
    /// How dimension names appear in generated `where` clauses.
    pub filter_style: FilterStyle,

    /// Row limit applied by the HTTP query endpoint when none is given.
    pub default_limit: Option<u32>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            filter_style: FilterStyle::Templated,
            default_limit: Some(100),
        }
    }
}

/// When the HTTP server opens the tool connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// On the first request that needs it.
    #[default]
    Lazy,
    /// At startup, before accepting requests.
    Eager,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub connect: ConnectMode,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            connect: ConnectMode::Lazy,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `HEADLESS_BI_CONFIG`
    /// 2. `./headless-bi.toml`
    /// 3. `~/.config/headless-bi/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("headless-bi.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("headless-bi").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Client behaviour derived from these settings.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            handshake_timeout: self.tool.handshake_timeout(),
            verbs: self.verbs.clone(),
        }
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut closed = false;
            for ch in chars.by_ref() {
                if ch == '}' {
                    closed = true;
                    break;
                }
                var_name.push(ch);
            }
            if !closed {
                return Err(SettingsError::InvalidConfig(format!(
                    "unterminated variable reference in '{}'",
                    s
                )));
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_alphanumeric() || ch == '_' {
                    var_name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value = env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name))?;
        result.push_str(&value);
    }

    Ok(result)
}
