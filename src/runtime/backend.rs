//! Isolation backends driven by the [`Supervisor`](super::Supervisor).
//!
//! A backend turns a [`LaunchSpec`] into an OS command and knows how to signal,
//! pause and clean up what it started. Nothing outside the supervisor calls
//! into a backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use super::supervisor::LaunchSpec;
use super::{BlobStore, Signal};
use crate::error::SupervisorError;
use crate::registry::{ContainerId, Protocol};

/// Smallest memory limit a container may declare
pub const MIN_MEMORY_BYTES: u64 = 6 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Containers are host process groups
    #[default]
    Process,
    /// Containers are driven through the docker CLI
    Docker,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Self::Process),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Docker => f.write_str("docker"),
        }
    }
}

/// What the supervisor knows about a live main process
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    pub pid: u32,
    pub container: Option<ContainerId>,
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Make the image available to the container before its first process
    async fn prepare(&self, spec: &LaunchSpec) -> Result<(), SupervisorError>;

    /// Command for the container's main process
    fn main_command(&self, spec: &LaunchSpec) -> Result<Command, SupervisorError>;

    /// Command running `argv` inside an already running container
    fn exec_command(&self, spec: &LaunchSpec, argv: &[String])
    -> Result<Command, SupervisorError>;

    async fn signal(&self, target: &ProcessTarget, signal: Signal) -> Result<(), SupervisorError>;

    async fn pause(&self, target: &ProcessTarget) -> Result<(), SupervisorError> {
        self.signal(target, Signal::Stop).await
    }

    async fn resume(&self, target: &ProcessTarget) -> Result<(), SupervisorError> {
        self.signal(target, Signal::Cont).await
    }

    /// Free everything held for a container that no longer has processes
    async fn release(&self, container: &ContainerId) -> Result<(), SupervisorError>;
}

/// Deliver `signal` to the process group led by `pid`. A group that is
/// already gone is not an error.
pub(crate) fn signal_group(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    match nix::sys::signal::killpg(pgid, signal.to_nix()) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(SupervisorError::SignalFailed {
            handle: u64::from(pid),
            signal: signal.to_string(),
            reason: errno.to_string(),
        }),
    }
}

fn split_argv(argv: &[String]) -> Result<(&String, &[String]), SupervisorError> {
    argv.split_first().ok_or_else(|| SupervisorError::SpawnFailed {
        what: "container".to_string(),
        reason: "no command given and the image declares none".to_string(),
    })
}

// =============================================================================
// Host process backend
// =============================================================================

/// Runs each container as a host process group rooted in a private directory
/// holding the unpacked image archive.
pub struct HostProcessBackend {
    containers_dir: PathBuf,
    blobs: Arc<BlobStore>,
}

impl HostProcessBackend {
    pub fn new(containers_dir: PathBuf, blobs: Arc<BlobStore>) -> Self {
        Self {
            containers_dir,
            blobs,
        }
    }

    fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.containers_dir.join(id.as_str())
    }

    fn rootfs(&self, id: &ContainerId) -> PathBuf {
        self.container_dir(id).join("rootfs")
    }

    fn base_command(&self, spec: &LaunchSpec, argv: &[String]) -> Result<Command, SupervisorError> {
        let (program, args) = split_argv(argv)?;
        let rootfs = self.rootfs(&spec.container_id);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&rootfs)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
            )
            .env("HOME", &rootfs)
            .env("HOSTNAME", spec.container_id.short())
            .envs(&spec.env);
        Ok(cmd)
    }

    fn backend_error(reason: impl std::fmt::Display) -> SupervisorError {
        SupervisorError::Backend {
            backend: BackendKind::Process.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ContainerBackend for HostProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn prepare(&self, spec: &LaunchSpec) -> Result<(), SupervisorError> {
        let rootfs = self.rootfs(&spec.container_id);
        let marker = self.container_dir(&spec.container_id).join(".unpacked");

        tokio::fs::create_dir_all(&rootfs)
            .await
            .map_err(Self::backend_error)?;

        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            return Ok(());
        }

        if self.blobs.contains(&spec.image.id).await {
            debug!(container_id = %spec.container_id, image = %spec.image.id, "unpacking image archive");
            self.blobs
                .unpack(&spec.image.id, &rootfs)
                .await
                .map_err(Self::backend_error)?;
        }

        tokio::fs::write(&marker, spec.image.id.as_bytes())
            .await
            .map_err(Self::backend_error)
    }

    fn main_command(&self, spec: &LaunchSpec) -> Result<Command, SupervisorError> {
        let mut cmd = self.base_command(spec, &spec.command)?;

        #[cfg(target_os = "linux")]
        if let Some(limit) = spec.limits.memory_bytes {
            use nix::sys::resource::{Resource, setrlimit};
            // SAFETY: setrlimit is async-signal-safe and touches no shared state
            unsafe {
                cmd.pre_exec(move || {
                    setrlimit(Resource::RLIMIT_AS, limit, limit).map_err(std::io::Error::from)
                });
            }
        }

        Ok(cmd)
    }

    fn exec_command(
        &self,
        spec: &LaunchSpec,
        argv: &[String],
    ) -> Result<Command, SupervisorError> {
        self.base_command(spec, argv)
    }

    async fn signal(&self, target: &ProcessTarget, signal: Signal) -> Result<(), SupervisorError> {
        signal_group(target.pid, signal)
    }

    async fn release(&self, container: &ContainerId) -> Result<(), SupervisorError> {
        match tokio::fs::remove_dir_all(self.container_dir(container)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::backend_error(e)),
        }
    }
}

// =============================================================================
// Docker CLI backend
// =============================================================================

/// Drives containers through the `docker` command line client
pub struct DockerCliBackend {
    binary: String,
}

impl DockerCliBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn container_name(id: &ContainerId) -> String {
        format!("keel-{}", id.as_str())
    }

    fn backend_error(reason: impl std::fmt::Display) -> SupervisorError {
        SupervisorError::Backend {
            backend: BackendKind::Docker.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Run a short docker command to completion; stderr becomes the error
    async fn docker(&self, args: &[&str]) -> Result<String, SupervisorError> {
        debug!("docker {}", args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SupervisorError::SpawnFailed {
                what: self.binary.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Self::backend_error(
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    fn is_gone(err: &SupervisorError) -> bool {
        matches!(err, SupervisorError::Backend { reason, .. }
            if reason.contains("No such container") || reason.contains("is not running"))
    }
}

#[async_trait]
impl ContainerBackend for DockerCliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn prepare(&self, spec: &LaunchSpec) -> Result<(), SupervisorError> {
        let reference = spec.image.key();
        match self.docker(&["image", "inspect", "--format", "{{.Id}}", &reference]).await {
            Ok(_) => Ok(()),
            Err(SupervisorError::Backend { .. }) => {
                Err(SupervisorError::ImageNotFound { reference })
            }
            Err(e) => Err(e),
        }
    }

    fn main_command(&self, spec: &LaunchSpec) -> Result<Command, SupervisorError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["run", "--rm", "--name"])
            .arg(Self::container_name(&spec.container_id));

        for (key, value) in &spec.env {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        for port in &spec.ports {
            let proto = match port.protocol {
                Protocol::Tcp => "tcp",
                Protocol::Udp => "udp",
            };
            let published = match &port.host_ip {
                Some(ip) => format!("{}:{}:{}/{}", ip, port.host_port, port.container_port, proto),
                None => format!("{}:{}/{}", port.host_port, port.container_port, proto),
            };
            cmd.arg("-p").arg(published);
        }
        if let Some(limit) = spec.limits.memory_bytes {
            cmd.arg("--memory").arg(format!("{}b", limit));
        }

        cmd.arg(spec.image.key());
        cmd.args(&spec.command);
        Ok(cmd)
    }

    fn exec_command(
        &self,
        spec: &LaunchSpec,
        argv: &[String],
    ) -> Result<Command, SupervisorError> {
        split_argv(argv)?;
        let mut cmd = Command::new(&self.binary);
        cmd.args(["exec", "-i"])
            .arg(Self::container_name(&spec.container_id))
            .args(argv);
        Ok(cmd)
    }

    async fn signal(&self, target: &ProcessTarget, signal: Signal) -> Result<(), SupervisorError> {
        let Some(ref container) = target.container else {
            return signal_group(target.pid, signal);
        };
        let name = Self::container_name(container);
        match self.docker(&["kill", "-s", signal.name(), &name]).await {
            Err(e) if Self::is_gone(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn pause(&self, target: &ProcessTarget) -> Result<(), SupervisorError> {
        match target.container {
            Some(ref container) => {
                let name = Self::container_name(container);
                self.docker(&["pause", &name]).await.map(|_| ())
            }
            None => signal_group(target.pid, Signal::Stop),
        }
    }

    async fn resume(&self, target: &ProcessTarget) -> Result<(), SupervisorError> {
        match target.container {
            Some(ref container) => {
                let name = Self::container_name(container);
                self.docker(&["unpause", &name]).await.map(|_| ())
            }
            None => signal_group(target.pid, Signal::Cont),
        }
    }

    async fn release(&self, container: &ContainerId) -> Result<(), SupervisorError> {
        let name = Self::container_name(container);
        match self.docker(&["rm", "-f", &name]).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_gone(&e) => Ok(()),
            Err(e) => {
                warn!("Failed to remove docker container {}: {}", name, e);
                Err(e)
            }
        }
    }
}
