use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolbridge_core::{BridgeError, Result};

pub mod env_substitution;

pub use env_substitution::substitute_placeholders;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Raw server declarations. Kept untyped: malformed entries are
    /// filtered out later instead of failing the whole file.
    #[serde(default)]
    pub servers: Vec<Value>,
}

/// Per-method deadlines and shutdown grace windows, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_initialize_ms")]
    pub initialize_ms: u64,
    #[serde(default = "default_list_tools_ms")]
    pub list_tools_ms: u64,
    #[serde(default = "default_call_tool_ms")]
    pub call_tool_ms: u64,
    #[serde(default = "default_shutdown_ms")]
    pub shutdown_ms: u64,
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
}

impl TimeoutSettings {
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    pub fn list_tools(&self) -> Duration {
        Duration::from_millis(self.list_tools_ms)
    }

    pub fn call_tool(&self) -> Duration {
        Duration::from_millis(self.call_tool_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("initialize_ms", self.initialize_ms),
            ("list_tools_ms", self.list_tools_ms),
            ("call_tool_ms", self.call_tool_ms),
            ("shutdown_ms", self.shutdown_ms),
            ("exit_grace_ms", self.exit_grace_ms),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(BridgeError::ConfigError(format!(
                    "timeouts.{} must be greater than zero",
                    field
                )));
            }
        }
        Ok(())
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            initialize_ms: default_initialize_ms(),
            list_tools_ms: default_list_tools_ms(),
            call_tool_ms: default_call_tool_ms(),
            shutdown_ms: default_shutdown_ms(),
            exit_grace_ms: default_exit_grace_ms(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            timeouts: TimeoutSettings::default(),
            servers: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BridgeError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: BridgeConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to parse YAML: {}", e)))?;

        config.expand_env_vars();
        config.timeouts.validate()?;

        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(workspace_dir) = env::var("WORKSPACE_DIR") {
            self.workspace_dir = PathBuf::from(workspace_dir);
        }
    }
}

fn default_initialize_ms() -> u64 { 60_000 }
fn default_list_tools_ms() -> u64 { 15_000 }
fn default_call_tool_ms() -> u64 { 60_000 }
fn default_shutdown_ms() -> u64 { 2_500 }
fn default_exit_grace_ms() -> u64 { 1_500 }

fn default_workspace_dir() -> PathBuf {
    env::var("WORKSPACE_DIR")
        .unwrap_or_else(|_| ".".to_string())
        .into()
}
