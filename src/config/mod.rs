//! Configuration module for headless-bi.
//!
//! Handles the settings file, environment variables, and the resolved
//! launch configuration for the semantic-layer tool.

mod settings;
mod tool;

pub use settings::{
    expand_env_vars, ConnectMode, QuerySettings, ServerSettings, Settings, SettingsError,
    ToolSettings, CONFIG_ENV_VAR,
};
pub use tool::{manifest_path_in, ToolConfig, DBT_PATH_VAR, PROFILES_DIR_VAR, PROJECT_DIR_VAR};
