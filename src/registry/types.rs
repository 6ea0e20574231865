use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::KeelError;
use crate::runtime::ProcessHandle;

/// Container identifier, assigned once at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, the form shown in listings
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(12).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ContainerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of container lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Exited,
    Removing,
}

impl ContainerStatus {
    /// Edges of the lifecycle graph, including the rollback edges taken when a
    /// start or remove fails after its status was claimed.
    pub fn can_transition_to(self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Exited)
                | (Created, Removing)
                | (Stopped, Running)
                | (Exited, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Running, Exited)
                | (Paused, Stopped)
                | (Paused, Exited)
                | (Stopped, Removing)
                | (Exited, Removing)
                // rollbacks
                | (Running, Created)
                | (Removing, Created)
                | (Removing, Stopped)
                | (Removing, Exited)
        )
    }

    /// True while a main process is attached
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Removing => "removing",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Declared port mapping, written `[host_ip:]host_port:container_port[/proto]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl FromStr for PortMapping {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| KeelError::backend(format!("invalid port mapping '{}': {}", s, reason));

        let (addr, protocol) = match s.rsplit_once('/') {
            Some((addr, "tcp")) => (addr, Protocol::Tcp),
            Some((addr, "udp")) => (addr, Protocol::Udp),
            Some(_) => return Err(invalid("protocol must be tcp or udp")),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = addr.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [port] => (None, *port, *port),
            [host, container] => (None, *host, *container),
            [ip, host, container] => (Some(ip.to_string()), *host, *container),
            _ => return Err(invalid("expected host:container")),
        };

        let host_port = host_port
            .parse::<u16>()
            .map_err(|_| invalid("host port is not a number"))?;
        let container_port = container_port
            .parse::<u16>()
            .map_err(|_| invalid("container port is not a number"))?;

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref ip) = self.host_ip {
            write!(f, "{}:", ip)?;
        }
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}:{}/{}", self.host_port, self.container_port, proto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl FromStr for RestartPolicy {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" | "" => Ok(Self::No),
            "always" => Ok(Self::Always),
            "on-failure" => Ok(Self::OnFailure),
            "unless-stopped" => Ok(Self::UnlessStopped),
            other => Err(KeelError::backend(format!("unknown restart policy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
}

/// Everything declared for a container at `run` time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference as requested (`repo:tag` or content id)
    pub image: String,
    /// Command override; empty means the image default
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub restart_policy: RestartPolicy,
    pub limits: ResourceLimits,
}

/// Fields owned by the lifecycle engine and supervisor, never by callers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
    /// Set by an explicit stop so restart policies leave the container alone
    pub stopped_by_user: bool,
    #[serde(skip)]
    pub process: Option<ProcessHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub name: String,
    /// Content id of the image resolved at creation
    pub image_id: String,
    pub spec: ContainerSpec,
    pub status: ContainerStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub runtime: RuntimeState,
}

impl Container {
    pub fn new(
        name: impl Into<String>,
        image_id: impl Into<String>,
        spec: ContainerSpec,
    ) -> Self {
        Self {
            id: ContainerId::generate(),
            name: name.into(),
            image_id: image_id.into(),
            spec,
            status: ContainerStatus::Created,
            created_at: chrono::Utc::now(),
            runtime: RuntimeState::default(),
        }
    }
}

/// `repository:tag` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Result<Self, KeelError> {
        let reference = Self {
            repository: repository.into(),
            tag: tag.into(),
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Parse `repo[:tag]`, defaulting the tag to `latest`. A colon before the
    /// last slash belongs to a registry host, not a tag.
    pub fn parse(s: &str) -> Result<Self, KeelError> {
        let last_slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[last_slash..].rfind(':') {
            Some(i) => Self::new(&s[..last_slash + i], &s[last_slash + i + 1..]),
            None => Self::new(s, "latest"),
        }
    }

    fn validate(&self) -> Result<(), KeelError> {
        let repo_ok = !self.repository.is_empty()
            && self.repository.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/:".contains(c)
            })
            && !self.repository.starts_with('/')
            && !self.repository.ends_with('/');
        let tag_ok = !self.tag.is_empty()
            && self.tag.len() <= 128
            && self
                .tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));

        if repo_ok && tag_ok {
            Ok(())
        } else {
            Err(KeelError::backend(format!("invalid image reference: {}", self)))
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// One tag of a content-addressed image; several tags may share an `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub size: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Default command when a container declares none
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Derived on every snapshot: some container references `id`
    #[serde(default)]
    pub in_use: bool,
}

/// Repository and tag of an image whose tag moved to a newer image
pub const DANGLING: &str = "<none>";

impl Image {
    /// True once the tag moved on while containers still use this image
    pub fn is_dangling(&self) -> bool {
        self.repository == DANGLING && self.tag == DANGLING
    }

    /// Untagged copy of this record, reachable by id only
    pub fn into_dangling(self) -> Self {
        Self {
            repository: DANGLING.to_string(),
            tag: DANGLING.to_string(),
            ..self
        }
    }

    /// Registry key and the name handed to backends: `repository:tag`, or
    /// the content id for a dangling image
    pub fn key(&self) -> String {
        if self.is_dangling() {
            self.id.clone()
        } else {
            self.reference().to_string()
        }
    }

    pub fn reference(&self) -> ImageReference {
        ImageReference {
            repository: self.repository.clone(),
            tag: self.tag.clone(),
        }
    }

    pub fn short_id(&self) -> &str {
        let hex = self.id.strip_prefix("sha256:").unwrap_or(&self.id);
        &hex[..hex.len().min(12)]
    }
}

/// Change notification published by the registry after each mutation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    ContainerCreated {
        container: Container,
    },
    ContainerStatusChanged {
        id: ContainerId,
        from: ContainerStatus,
        to: ContainerStatus,
    },
    ContainerUpdated {
        id: ContainerId,
    },
    ContainerRemoved {
        id: ContainerId,
    },
    ImageAdded {
        image: Image,
    },
    ImageRemoved {
        id: String,
        reference: String,
    },
}
