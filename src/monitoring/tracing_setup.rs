use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{ConfigError, Result};

/// Subscriber configuration for the keel binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub log_level: String,
    pub json: bool,
    /// Daily-rolling log file; the file name is used as the prefix
    pub file: Option<PathBuf>,
}

impl TracingConfig {
    /// Install the global subscriber. `RUST_LOG` overrides `log_level`.
    ///
    /// The returned guard flushes the file writer and must be kept alive for
    /// as long as logging is wanted.
    pub fn init_tracing(&self) -> Result<Option<WorkerGuard>> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let (file_layer, guard) = match self.file {
            Some(ref path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                let prefix = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "keel.log".to_string());
                std::fs::create_dir_all(&dir)?;

                let appender = tracing_appender::rolling::daily(dir, prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false).json();
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let (json_layer, compact_layer) = if self.json {
            (
                Some(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                ),
                None,
            )
        } else {
            (
                None,
                Some(
                    fmt::layer()
                        .with_target(false)
                        .compact()
                        .with_writer(std::io::stderr),
                ),
            )
        };

        Registry::default()
            .with(env_filter)
            .with(json_layer)
            .with(compact_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| ConfigError::InvalidValue {
                field: "logging".to_string(),
                reason: e.to_string(),
            })?;

        Ok(guard)
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Times an operation and logs the outcome when finished
pub struct OperationTimer {
    start_time: Instant,
    operation: String,
    context: HashMap<String, String>,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            start_time: Instant::now(),
            operation: operation.to_string(),
            context: HashMap::new(),
        }
    }

    pub fn add_context(&mut self, key: &str, value: &str) {
        self.context.insert(key.to_string(), value.to_string());
    }

    pub fn finish_with_result<T, E>(self, result: &std::result::Result<T, E>) -> Duration
    where
        E: std::fmt::Display,
    {
        let duration = self.start_time.elapsed();

        match result {
            Ok(_) => {
                tracing::info!(
                    operation = %self.operation,
                    duration_ms = %duration.as_millis(),
                    success = true,
                    context = ?self.context,
                    "Operation finished"
                );
            }
            Err(e) => {
                tracing::warn!(
                    operation = %self.operation,
                    duration_ms = %duration.as_millis(),
                    success = false,
                    error = %e,
                    context = ?self.context,
                    "Operation failed"
                );
            }
        }

        duration
    }
}
