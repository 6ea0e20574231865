use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keel error types, classified into the stable vocabulary of [`ErrorKind`]
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("container {id} is {state}: {reason}")]
    InvalidState {
        id: String,
        state: String,
        reason: String,
    },

    #[error("image {id} is in use by containers: {}", .containers.join(", "))]
    ResourceInUse { id: String, containers: Vec<String> },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("Process supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable error vocabulary surfaced across the facade boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    ResourceInUse,
    Conflict,
    BackendFailure,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "NotFound",
            Self::InvalidState => "InvalidState",
            Self::ResourceInUse => "ResourceInUse",
            Self::Conflict => "Conflict",
            Self::BackendFailure => "BackendFailure",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl KeelError {
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "container",
            id: id.into(),
        }
    }

    pub fn image_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "image",
            id: id.into(),
        }
    }

    pub fn invalid_state(
        id: impl Into<String>,
        state: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            state: state.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backend(cause: impl std::fmt::Display) -> Self {
        Self::BackendFailure(cause.to_string())
    }

    /// Classify this error into the external vocabulary
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::ResourceInUse { .. } => ErrorKind::ResourceInUse,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Supervisor(SupervisorError::ImageNotFound { .. }) => ErrorKind::NotFound,
            Self::Supervisor(SupervisorError::PortConflict { .. }) => ErrorKind::Conflict,
            Self::BackendFailure(_)
            | Self::Supervisor(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Json(_) => ErrorKind::BackendFailure,
        }
    }
}

/// Failures raised at the OS boundary by the process supervisor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("image not available to backend: {reference}")]
    ImageNotFound { reference: String },

    #[error("host port {port} already claimed by container {holder}")]
    PortConflict { port: u16, holder: String },

    #[error("resource limit rejected: {reason}")]
    ResourceLimit { reason: String },

    #[error("failed to spawn {what}: {reason}")]
    SpawnFailed { what: String, reason: String },

    #[error("unknown process handle {0}")]
    UnknownHandle(u64),

    #[error("process handle {0} has already been waited on")]
    AlreadyWaited(u64),

    #[error("failed to deliver {signal} to handle {handle}: {reason}")]
    SignalFailed {
        handle: u64,
        signal: String,
        reason: String,
    },

    #[error("{backend} backend error: {reason}")]
    Backend { backend: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found at path: {path}")]
    NotFound { path: String },

    #[error("Invalid config format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Convenience type alias for Keel results
pub type Result<T, E = KeelError> = std::result::Result<T, E>;
