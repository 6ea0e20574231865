use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::monitoring::TracingConfig;
use crate::runtime::{BackendKind, LifecycleSettings};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    /// Binary used by the docker backend, sources and builder
    pub docker_binary: String,
    pub stop_grace_period_secs: u64,
    pub kill_timeout_secs: u64,
    pub log_buffer_lines: usize,
    pub event_capacity: usize,
    pub max_restarts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Process,
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("keel"),
            docker_binary: "docker".to_string(),
            stop_grace_period_secs: 10,
            kill_timeout_secs: 5,
            log_buffer_lines: 1000,
            event_capacity: 256,
            max_restarts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImagesConfig {
    /// Archive mirror used by the process backend
    pub mirror: Option<String>,
    pub pull_retries: u32,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            mirror: None,
            pull_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2377".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Top-level `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeelConfig {
    pub engine: EngineConfig,
    pub images: ImagesConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl KeelConfig {
    /// `$XDG_CONFIG_HOME/keel/config.toml` or the platform equivalent
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel")
            .join("config.toml")
    }

    /// Load from `path`, or from the default location if `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path(), false),
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigError::NotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::parse(&content)?;
        info!("📋 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: KeelConfig = toml::from_str(content).map_err(|e| ConfigError::InvalidFormat {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat {
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.engine.log_buffer_lines == 0 {
            return Err(invalid("engine.log_buffer_lines", "must be at least 1"));
        }
        if self.engine.event_capacity == 0 {
            return Err(invalid("engine.event_capacity", "must be at least 1"));
        }
        if self.engine.kill_timeout_secs == 0 {
            return Err(invalid("engine.kill_timeout_secs", "must be at least 1"));
        }
        if self.engine.docker_binary.trim().is_empty() {
            return Err(invalid("engine.docker_binary", "must not be empty"));
        }
        if self.images.pull_retries == 0 {
            return Err(invalid("images.pull_retries", "must be at least 1"));
        }
        if let Some(ref mirror) = self.images.mirror {
            if !(mirror.starts_with("http://") || mirror.starts_with("https://")) {
                return Err(invalid("images.mirror", "must be an http(s) URL"));
            }
        }
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(invalid("server.listen", "must be an address like 127.0.0.1:2377"));
        }
        Ok(())
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            stop_grace_period: Duration::from_secs(self.engine.stop_grace_period_secs),
            kill_timeout: Duration::from_secs(self.engine.kill_timeout_secs),
            max_restarts: self.engine.max_restarts,
            ..LifecycleSettings::default()
        }
    }

    pub fn tracing(&self) -> TracingConfig {
        TracingConfig {
            log_level: self.logging.level.clone(),
            json: self.logging.json,
            file: self.logging.file.clone(),
        }
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.engine.data_dir.join("images")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.engine.data_dir.join("containers")
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.engine.data_dir.join("builds")
    }
}
