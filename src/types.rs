//! Shapes exchanged with callers of the facade and the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, KeelError};
use crate::registry::{Container, ContainerStatus, Image};
use crate::streams::ExecEvent;

/// Container information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub status: ContainerStatus,
    /// Human form, e.g. `Up 5 minutes` or `Exited (0) 2 hours ago`
    pub status_text: String,
    pub ports: Vec<String>,
    pub command: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
    pub restart_policy: String,
}

impl ContainerInfo {
    pub fn from_container(container: &Container, now: DateTime<Utc>) -> Self {
        let restart_policy = serde_json::to_value(container.spec.restart_policy)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "no".to_string());

        Self {
            id: container.id.to_string(),
            name: container.name.clone(),
            image: container.spec.image.clone(),
            image_id: container.image_id.clone(),
            status: container.status,
            status_text: describe_status(container, now),
            ports: container.spec.ports.iter().map(ToString::to_string).collect(),
            command: container.spec.command.clone(),
            created_at: container.created_at,
            started_at: container.runtime.started_at,
            finished_at: container.runtime.finished_at,
            exit_code: container.runtime.exit_code,
            restart_count: container.runtime.restart_count,
            restart_policy,
        }
    }
}

impl From<&Container> for ContainerInfo {
    fn from(container: &Container) -> Self {
        Self::from_container(container, Utc::now())
    }
}

/// Docker-style status line for a container
pub fn describe_status(container: &Container, now: DateTime<Utc>) -> String {
    let since = |t: Option<DateTime<Utc>>| humanize(now - t.unwrap_or(container.created_at));
    match container.status {
        ContainerStatus::Created => "Created".to_string(),
        ContainerStatus::Running => format!("Up {}", since(container.runtime.started_at)),
        ContainerStatus::Paused => format!("Up {} (Paused)", since(container.runtime.started_at)),
        ContainerStatus::Stopped => format!(
            "Stopped ({}) {} ago",
            container.runtime.exit_code.unwrap_or(0),
            since(container.runtime.finished_at)
        ),
        ContainerStatus::Exited => format!(
            "Exited ({}) {} ago",
            container.runtime.exit_code.unwrap_or(0),
            since(container.runtime.finished_at)
        ),
        ContainerStatus::Removing => "Removal In Progress".to_string(),
    }
}

fn humanize(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", n, unit)
        }
    };
    match secs {
        0 => "Less than a second".to_string(),
        1..=59 => plural(secs, "second"),
        60..=3599 => plural(secs / 60, "minute"),
        3600..=86_399 => plural(secs / 3600, "hour"),
        _ => plural(secs / 86_400, "day"),
    }
}

/// Image information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub short_id: String,
    pub repository: String,
    pub tag: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub in_use: bool,
}

impl From<&Image> for ImageInfo {
    fn from(image: &Image) -> Self {
        Self {
            id: image.id.clone(),
            short_id: image.short_id().to_string(),
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            size: image.size,
            created_at: image.created_at,
            in_use: image.in_use,
        }
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_containers: usize,
    pub running_containers: usize,
    pub paused_containers: usize,
    pub stopped_containers: usize,
    pub total_images: usize,
    pub hostname: String,
    pub cpus: usize,
    pub backend: String,
}

/// Error as reported across the facade boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<KeelError> for ApiError {
    fn from(err: KeelError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Request to create and start a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub image: String,
    pub name: Option<String>,
    /// `[ip:]host:container[/proto]`
    pub ports: Vec<String>,
    /// Shell command line; run through `sh -c`
    pub command: Option<String>,
    /// `KEY=VALUE`
    pub env: Vec<String>,
    /// `no`, `always`, `on-failure` or `unless-stopped`
    pub restart: Option<String>,
    /// Bytes, or with a `k`/`m`/`g` suffix
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub path: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
}

/// Exec output in transport form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecChunk {
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
}

impl From<ExecEvent> for ExecChunk {
    fn from(event: ExecEvent) -> Self {
        match event {
            ExecEvent::Stdout(bytes) => Self::Stdout {
                data: String::from_utf8_lossy(&bytes).into_owned(),
            },
            ExecEvent::Stderr(bytes) => Self::Stderr {
                data: String::from_utf8_lossy(&bytes).into_owned(),
            },
            ExecEvent::Exit(code) => Self::Exit { code },
        }
    }
}

/// Parse `512m`, `1g`, `64k` or a plain byte count
pub fn parse_memory(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory("64kb"), Some(64 * 1024));
        assert_eq!(parse_memory("4096"), Some(4096));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory(""), None);
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(chrono::Duration::seconds(0)), "Less than a second");
        assert_eq!(humanize(chrono::Duration::seconds(1)), "1 second");
        assert_eq!(humanize(chrono::Duration::seconds(150)), "2 minutes");
        assert_eq!(humanize(chrono::Duration::hours(3)), "3 hours");
        assert_eq!(humanize(chrono::Duration::days(2)), "2 days");
    }

    #[test]
    fn test_api_error_from_keel_error() {
        let err = KeelError::invalid_state("abc", ContainerStatus::Running, "stop the container first");
        let api = ApiError::from(err);
        assert_eq!(api.kind, ErrorKind::InvalidState);
        assert!(api.message.contains("running"));
    }
}
