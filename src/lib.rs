//! Keel - a local container engine core
//!
//! This crate tracks containers and images, supervises container processes,
//! drives the container lifecycle, pulls and builds images, and brokers log
//! and exec streams. [`KeelRuntime`] is the command surface callers use.

pub mod builds;
pub mod config;
pub mod error;
pub mod images;
pub mod monitoring;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod streams;
pub mod types;

pub use config::KeelConfig;
pub use error::{ErrorKind, KeelError, Result};
pub use types::{ApiError, ContainerInfo, ImageInfo, RunRequest, SystemStats};

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use builds::{DockerCliBuilder, ImageBuilder, LocalBuilder};
use images::{
    DockerCliSource, ImageService, ImageSource, MirrorSource, NoMirrorSource, Operation,
    ProgressEvent,
};
use monitoring::OperationTimer;
use registry::{
    ContainerId, ContainerSpec, ContainerStatus, ImageReference, PortMapping, Registry,
    RegistryEvent, ResourceLimits, RestartPolicy,
};
use runtime::{
    BackendKind, BlobStore, ContainerBackend, DockerCliBackend, HostProcessBackend,
    LifecycleEngine, Supervisor,
};
use streams::{ExecStream, LogEntry, LogFeed, StreamBroker};

/// Result type of the command surface
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Core Keel API for container and image management
pub struct KeelRuntime {
    config: KeelConfig,
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    broker: Arc<StreamBroker>,
    lifecycle: Arc<LifecycleEngine>,
    images: ImageService,
}

impl KeelRuntime {
    /// Create a runtime with the image source and builder of the configured
    /// backend
    pub async fn new(config: KeelConfig) -> Result<Self> {
        Self::assemble(config, None).await
    }

    /// Create a runtime that pulls from `source` instead
    pub async fn with_image_source(config: KeelConfig, source: Arc<dyn ImageSource>) -> Result<Self> {
        Self::assemble(config, Some(source)).await
    }

    async fn assemble(config: KeelConfig, source: Option<Arc<dyn ImageSource>>) -> Result<Self> {
        config.validate()?;
        info!(
            "🚀 Starting Keel engine (backend: {}, data: {})",
            config.engine.backend,
            config.engine.data_dir.display()
        );

        let blobs = Arc::new(BlobStore::new(config.blobs_dir())?);
        blobs.clear_tmp().await?;

        let backend: Arc<dyn ContainerBackend> = match config.engine.backend {
            BackendKind::Process => Arc::new(HostProcessBackend::new(
                config.containers_dir(),
                Arc::clone(&blobs),
            )),
            BackendKind::Docker => Arc::new(DockerCliBackend::new(&config.engine.docker_binary)),
        };
        let supervisor = Arc::new(Supervisor::new(backend));
        let registry = Arc::new(Registry::new(config.engine.event_capacity));
        let broker = Arc::new(StreamBroker::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            config.engine.log_buffer_lines,
        ));
        let lifecycle = LifecycleEngine::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::clone(&broker),
            config.lifecycle_settings(),
        );

        let docker = &config.engine.docker_binary;
        let (default_source, builder): (Arc<dyn ImageSource>, Arc<dyn ImageBuilder>) =
            match config.engine.backend {
                BackendKind::Process => {
                    let source: Arc<dyn ImageSource> = match config.images.mirror {
                        Some(ref mirror) => Arc::new(MirrorSource::new(
                            mirror.clone(),
                            Arc::clone(&blobs),
                            config.images.pull_retries,
                        )),
                        None => Arc::new(NoMirrorSource),
                    };
                    let builder = LocalBuilder::new(
                        Arc::clone(&supervisor),
                        Arc::clone(&blobs),
                        config.builds_dir(),
                    );
                    (source, Arc::new(builder))
                }
                BackendKind::Docker => (
                    Arc::new(DockerCliSource::new(Arc::clone(&supervisor), docker.clone())),
                    Arc::new(DockerCliBuilder::new(Arc::clone(&supervisor), docker.clone())),
                ),
            };
        let source = source.unwrap_or(default_source);
        debug!("image source: {}", source.name());

        let images = ImageService::new(
            Arc::clone(&registry),
            blobs,
            source,
            builder,
            config.engine.event_capacity,
        );

        Ok(Self {
            config,
            registry,
            supervisor,
            broker,
            lifecycle,
            images,
        })
    }

    /// Get the runtime configuration
    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// List containers, optionally only those whose status matches `status`
    /// (any form accepted by [`normalize_status`])
    pub fn list_containers(&self, status: Option<&str>) -> ApiResult<Vec<ContainerInfo>> {
        let wanted = match status {
            Some(raw) => Some(normalize_status(raw).ok_or_else(|| {
                ApiError::new(ErrorKind::BackendFailure, format!("unknown status filter: {}", raw))
            })?),
            None => None,
        };
        let now = chrono::Utc::now();
        Ok(self
            .registry
            .list()
            .iter()
            .filter(|c| wanted.is_none_or(|s| c.status == s))
            .map(|c| ContainerInfo::from_container(c, now))
            .collect())
    }

    /// Create and start a container
    pub async fn run_container(&self, request: RunRequest) -> ApiResult<ContainerInfo> {
        let spec = container_spec(&request)?;
        info!("🏃 Running container from {}", spec.image);
        let container = self.lifecycle.run(request.name.clone(), spec).await?;
        Ok(ContainerInfo::from(&container))
    }

    pub async fn start_container(&self, id: &str) -> ApiResult<ContainerInfo> {
        let container = self.lifecycle.start(&ContainerId::from(id)).await?;
        Ok(ContainerInfo::from(&container))
    }

    pub async fn stop_container(&self, id: &str) -> ApiResult<ContainerInfo> {
        let container = self.lifecycle.stop(&ContainerId::from(id)).await?;
        Ok(ContainerInfo::from(&container))
    }

    pub async fn pause_container(&self, id: &str) -> ApiResult<ContainerInfo> {
        let container = self.lifecycle.pause(&ContainerId::from(id)).await?;
        Ok(ContainerInfo::from(&container))
    }

    pub async fn unpause_container(&self, id: &str) -> ApiResult<ContainerInfo> {
        let container = self.lifecycle.unpause(&ContainerId::from(id)).await?;
        Ok(ContainerInfo::from(&container))
    }

    /// Remove a container that is not running
    pub async fn remove_container(&self, id: &str) -> ApiResult<()> {
        self.lifecycle.remove(&ContainerId::from(id)).await?;
        Ok(())
    }

    pub fn inspect_container(&self, id: &str) -> ApiResult<ContainerInfo> {
        let container = self.registry.get(&ContainerId::from(id))?;
        Ok(ContainerInfo::from(&container))
    }

    /// Run `command` through `sh -c` inside a running container
    pub async fn exec_into_container(&self, id: &str, command: &str) -> ApiResult<ExecStream> {
        if command.trim().is_empty() {
            return Err(ApiError::new(ErrorKind::BackendFailure, "exec requires a command"));
        }
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        Ok(self.broker.exec(&ContainerId::from(id), argv).await?)
    }

    /// Buffered log lines followed by live output
    pub fn stream_logs(&self, id: &str) -> ApiResult<LogFeed> {
        Ok(self.broker.attach_logs(&ContainerId::from(id))?)
    }

    /// Buffered log lines only
    pub fn recent_logs(&self, id: &str) -> ApiResult<Vec<LogEntry>> {
        let id = ContainerId::from(id);
        self.registry.get(&id)?;
        Ok(self.broker.recent_logs(&id))
    }

    // =========================================================================
    // Images
    // =========================================================================

    pub fn list_images(&self) -> Vec<ImageInfo> {
        self.images.list().iter().map(ImageInfo::from).collect()
    }

    /// Pull `repository:tag`; the tag defaults to `latest`
    pub async fn pull_image(&self, repository: &str, tag: Option<&str>) -> ApiResult<ImageInfo> {
        let tag = tag.unwrap_or("latest");
        let mut timer = OperationTimer::new("pull_image");
        timer.add_context("reference", &format!("{}:{}", repository, tag));

        let result = self.images.pull(repository, tag).await;
        timer.finish_with_result(&result);
        Ok(ImageInfo::from(&result?))
    }

    pub fn cancel_pull(&self, repository: &str, tag: Option<&str>) -> ApiResult<bool> {
        let reference = ImageReference::new(repository, tag.unwrap_or("latest"))?;
        Ok(self.images.cancel(Operation::Pull, &reference))
    }

    /// Build the context directory at `path` as `tag`
    pub async fn build_image(&self, path: &str, tag: &str) -> ApiResult<ImageInfo> {
        let mut timer = OperationTimer::new("build_image");
        timer.add_context("context", path);
        timer.add_context("tag", tag);

        let result = self.images.build(path, tag).await;
        timer.finish_with_result(&result);
        Ok(ImageInfo::from(&result?))
    }

    pub fn cancel_build(&self, tag: &str) -> ApiResult<bool> {
        let reference = ImageReference::parse(tag)?;
        Ok(self.images.cancel(Operation::Build, &reference))
    }

    /// Remove an image by `repo:tag` or id; fails while any container uses it
    pub async fn remove_image(&self, reference: &str) -> ApiResult<Vec<ImageInfo>> {
        let removed = self.images.remove(reference).await?;
        Ok(removed.iter().map(ImageInfo::from).collect())
    }

    // =========================================================================
    // Events and system
    // =========================================================================

    pub fn subscribe_changes(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.images.subscribe_progress()
    }

    pub fn stats(&self) -> SystemStats {
        let containers = self.registry.list();
        let count = |status: ContainerStatus| containers.iter().filter(|c| c.status == status).count();
        let running = count(ContainerStatus::Running);
        let paused = count(ContainerStatus::Paused);

        SystemStats {
            total_containers: containers.len(),
            running_containers: running,
            paused_containers: paused,
            stopped_containers: containers.len() - running - paused,
            total_images: self.registry.list_images().len(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            cpus: num_cpus::get(),
            backend: self.config.engine.backend.to_string(),
        }
    }

    /// Stop every active container and kill anything still tracked
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down Keel engine");
        self.lifecycle.shutdown().await;
        self.supervisor.shutdown().await;
    }
}

/// Translate a run request into a container spec
fn container_spec(request: &RunRequest) -> ApiResult<ContainerSpec> {
    let bad_request = |message: String| ApiError::new(ErrorKind::BackendFailure, message);

    if request.image.trim().is_empty() {
        return Err(bad_request("an image is required".to_string()));
    }

    let ports = request
        .ports
        .iter()
        .map(|p| p.parse::<PortMapping>())
        .collect::<Result<Vec<_>>>()?;

    let mut env = BTreeMap::new();
    for pair in &request.env {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.insert(key.to_string(), value.to_string());
            }
            _ => return Err(bad_request(format!("invalid environment variable '{}', expected KEY=VALUE", pair))),
        }
    }

    let restart_policy = match request.restart {
        Some(ref policy) => policy.parse::<RestartPolicy>()?,
        None => RestartPolicy::No,
    };

    let memory_bytes = match request.memory {
        Some(ref memory) => Some(
            types::parse_memory(memory)
                .ok_or_else(|| bad_request(format!("invalid memory limit: {}", memory)))?,
        ),
        None => None,
    };

    let command = match request.command {
        Some(ref cmd) if !cmd.trim().is_empty() => {
            vec!["sh".to_string(), "-c".to_string(), cmd.clone()]
        }
        _ => Vec::new(),
    };

    Ok(ContainerSpec {
        image: request.image.trim().to_string(),
        command,
        env,
        ports,
        restart_policy,
        limits: ResourceLimits { memory_bytes },
    })
}

/// Map a free-form status string (`running`, `Up 2 hours`,
/// `Exited (0) 3 minutes ago`, `Up 5 minutes (Paused)`) onto the closed
/// status set
pub fn normalize_status(raw: &str) -> Option<ContainerStatus> {
    static STATUS: OnceLock<Option<Regex>> = OnceLock::new();
    let raw = raw.trim().to_ascii_lowercase();
    if raw.contains("(paused)") {
        return Some(ContainerStatus::Paused);
    }

    let re = STATUS
        .get_or_init(|| {
            Regex::new(
                r"^(up|running|restarting|paused|created|stopped|exited|dead|removing|removal in progress)\b",
            )
            .ok()
        })
        .as_ref()?;
    let word = re.captures(&raw)?.get(1)?.as_str();
    Some(match word {
        "up" | "running" | "restarting" => ContainerStatus::Running,
        "paused" => ContainerStatus::Paused,
        "created" => ContainerStatus::Created,
        "stopped" => ContainerStatus::Stopped,
        "exited" | "dead" => ContainerStatus::Exited,
        _ => ContainerStatus::Removing,
    })
}
