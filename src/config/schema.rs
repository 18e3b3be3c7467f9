//! Configuration schema for keygraph
//!
//! Configuration is stored at `~/.config/keygraph/config.toml`

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache manager settings
    pub manager: ManagerConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Cache manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Manager identifier (random when unset)
    pub id: Option<String>,

    /// Drop result associations whose artifacts are gone when the manager starts
    pub release_unreferenced_on_start: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            id: None,
            release_unreferenced_on_start: true,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Log format: "text" or "json"
    pub format: LogFormat,

    /// Include the event target in each line
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "keygraph=info".to_string(),
            format: LogFormat::Text,
            with_target: false,
        }
    }
}
