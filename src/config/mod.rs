//! Configuration for a cache manager process
//!
//! A single `config.toml` names the manager and its logging. The loader reads
//! it and opens a [`CacheManager`] over the caller's stores.

pub mod schema;

pub use schema::{Config, LogFormat, LoggingConfig, ManagerConfig};

use crate::error::{KeygraphError, KeygraphResult};
use crate::manager::CacheManager;
use crate::storage::{KeyStorage, ResultStorage};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Locates `config.toml` and turns it into a running manager
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    /// Loader for `<config dir>/keygraph/config.toml`
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keygraph")
            .join("config.toml")
    }

    /// Read the config file; a missing file yields the defaults
    pub async fn load(&self) -> KeygraphResult<Config> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => parse(&self.path, &content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", self.path.display());
                Ok(Config::default())
            }
            Err(e) => Err(KeygraphError::io(
                format!("reading config from {}", self.path.display()),
                e,
            )),
        }
    }

    /// Open a manager over `keys` and `results` as the config file describes
    ///
    /// A configured manager ID is reused across restarts so identifiers in
    /// persistent key storage keep resolving. Without one the manager gets a
    /// random ID.
    pub async fn open_manager(
        &self,
        keys: Arc<dyn KeyStorage>,
        results: Arc<dyn ResultStorage>,
    ) -> KeygraphResult<CacheManager> {
        let config = self.load().await?;
        let manager = CacheManager::from_config(&config, keys, results).await;
        info!(
            "Opened cache manager {} from {}",
            manager.id(),
            self.path.display()
        );
        Ok(manager)
    }

    /// Write `config`, creating the parent directory first
    pub async fn save(&self, config: &Config) -> KeygraphResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| KeygraphError::ConfigDirCreate {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.path, content).await.map_err(|e| {
            KeygraphError::io(format!("writing config to {}", self.path.display()), e)
        })?;
        debug!("Wrote config to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse(path: &Path, content: &str) -> KeygraphResult<Config> {
    toml::from_str(content).map_err(|e| KeygraphError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
