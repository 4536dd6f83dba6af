//! Configuration management for the job server

pub mod schema;

pub use schema::Config;

use crate::error::{JobServerError, JobServerResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jobserver")
            .join("config.toml")
    }

    /// Load configuration, falling back to defaults when the file is missing
    pub async fn load(&self) -> JobServerResult<Config> {
        let path = &self.config_path;
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(JobServerError::io(
                    format!("reading config from {}", path.display()),
                    e,
                ))
            }
        };

        let config: Config = toml::from_str(&content).map_err(|e| self.invalid(e.to_string()))?;
        self.validate(&config)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self, config: &Config) -> JobServerResult<()> {
        if config.server.listen.trim().is_empty() {
            return Err(self.invalid("server.listen must not be empty"));
        }
        if config.resolver.program.trim().is_empty() {
            return Err(self.invalid("resolver.program must not be empty"));
        }
        if !matches!(config.general.log_format.to_ascii_lowercase().as_str(), "text" | "json") {
            return Err(self.invalid(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                config.general.log_format
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> JobServerError {
        JobServerError::ConfigInvalid {
            path: self.config_path.clone(),
            reason: reason.into(),
        }
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
