//! Lifecycle engine: the container state machine.
//!
//! Every transition for a given container runs while holding that
//! container's slot lock, so transitions on one id are totally ordered while
//! different ids proceed independently. Status itself only ever changes
//! through [`Registry::compare_and_set_status`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use futures::future::BoxFuture;
use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, error, info, warn};

use super::{LaunchSpec, ProcessHandle, Signal, Supervisor};
use crate::error::{KeelError, Result, SupervisorError};
use crate::monitoring::log_container_event;
use crate::registry::{Container, ContainerId, ContainerSpec, ContainerStatus, Registry, RestartPolicy};
use crate::streams::StreamBroker;

/// Tunables for stop and restart behaviour
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// How long a stopped process gets between SIGTERM and SIGKILL
    pub stop_grace_period: Duration,
    /// How long to wait for exit after SIGKILL before giving up
    pub kill_timeout: Duration,
    /// Upper bound on automatic restarts per explicit start
    pub max_restarts: u32,
    /// Delay before the first automatic restart; doubles each time
    pub restart_backoff: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            stop_grace_period: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            max_restarts: 5,
            restart_backoff: Duration::from_millis(100),
        }
    }
}

/// Per-container serialization point. The guarded value is the exit watch
/// of the current main process, if one is attached.
#[derive(Default)]
struct Slot {
    process: Option<(ProcessHandle, watch::Receiver<Option<i32>>)>,
}

pub struct LifecycleEngine {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    broker: Arc<StreamBroker>,
    settings: LifecycleSettings,
    slots: Mutex<HashMap<ContainerId, Arc<tokio::sync::Mutex<Slot>>>>,
    this: Weak<LifecycleEngine>,
}

impl LifecycleEngine {
    pub fn new(
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        broker: Arc<StreamBroker>,
        settings: LifecycleSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            supervisor,
            broker,
            settings,
            slots: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    async fn lock(&self, id: &ContainerId) -> OwnedMutexGuard<Slot> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(id.clone()).or_default())
        };
        slot.lock_owned().await
    }

    fn forget_slot(&self, id: &ContainerId) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Create a container and start it.
    ///
    /// The row is inserted as `created`; if the process cannot be started it
    /// ends in `exited` and the spawn error is returned.
    pub async fn run(&self, name: Option<String>, spec: ContainerSpec) -> Result<Container> {
        let image = self.registry.get_image(&spec.image)?;
        let name = match name {
            Some(name) => validate_name(name)?,
            None => generate_name(),
        };

        let container = Container::new(name, image.id.clone(), spec);
        let id = container.id.clone();
        self.registry.upsert(container.clone())?;
        log_container_event(&id, "create", &container.name);

        let mut slot = self.lock(&id).await;
        if let Err(e) = self.launch(&mut slot, &container, ContainerStatus::Created).await {
            if self.registry.compare_and_set_status(&id, ContainerStatus::Created, ContainerStatus::Exited) {
                let _ = self.registry.update_runtime(&id, |rt| {
                    rt.finished_at = Some(chrono::Utc::now());
                });
            }
            error!(container_id = %id, "❌ Failed to start container: {}", e);
            return Err(e);
        }
        drop(slot);

        self.registry.get(&id)
    }

    /// Start a created, stopped or exited container. Starting a running
    /// container is a no-op.
    pub async fn start(&self, id: &ContainerId) -> Result<Container> {
        self.registry.get(id)?;
        let mut slot = self.lock(id).await;
        let container = self.registry.get(id)?;

        match container.status {
            ContainerStatus::Running => return Ok(container),
            ContainerStatus::Created | ContainerStatus::Stopped | ContainerStatus::Exited => {}
            ContainerStatus::Paused => {
                return Err(KeelError::invalid_state(id.as_str(), container.status, "unpause it instead"));
            }
            ContainerStatus::Removing => {
                return Err(KeelError::invalid_state(id.as_str(), container.status, "container is being removed"));
            }
        }

        self.registry.update_runtime(id, |rt| {
            rt.restart_count = 0;
        })?;
        self.launch(&mut slot, &container, container.status).await?;
        drop(slot);
        self.registry.get(id)
    }

    /// Claim `running`, spawn, and hook up logs and exit monitoring. On
    /// spawn failure the status goes back to `from`.
    async fn launch(&self, slot: &mut Slot, container: &Container, from: ContainerStatus) -> Result<()> {
        let id = &container.id;
        if !self.registry.compare_and_set_status(id, from, ContainerStatus::Running) {
            return Err(KeelError::Conflict(format!(
                "container {} changed state during start",
                id.short()
            )));
        }

        let spawned = match self.spawn_main(container).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.registry
                    .compare_and_set_status(id, ContainerStatus::Running, from);
                return Err(e);
            }
        };

        let handle = spawned.handle;
        self.registry.update_runtime(id, |rt| {
            rt.started_at = Some(chrono::Utc::now());
            rt.finished_at = None;
            rt.exit_code = None;
            rt.stopped_by_user = false;
            rt.process = Some(handle);
        })?;
        slot.process = Some((handle, spawned.exit.clone()));
        self.broker.attach_process(id, spawned.stdout, spawned.stderr);

        if let Some(engine) = self.this.upgrade() {
            tokio::spawn(engine.monitor(id.clone(), handle));
        }

        log_container_event(id, "start", &container.name);
        Ok(())
    }

    async fn spawn_main(&self, container: &Container) -> Result<super::Spawned> {
        let image = self.registry.get_image(&container.image_id)?;
        let spec = LaunchSpec::new(container, &image);
        Ok(self.supervisor.spawn(&spec).await?)
    }

    /// Reaps the main process and records its exit unless a stop already
    /// did; applies the restart policy.
    fn monitor(self: Arc<Self>, id: ContainerId, handle: ProcessHandle) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let code = match self.supervisor.wait(handle).await {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(container_id = %id, "Lost track of container process: {}", e);
                    None
                }
            };

            let mut slot = self.lock(&id).await;
            if slot.process.as_ref().map(|(h, _)| *h) != Some(handle) {
                return;
            }
            slot.process = None;

            let Ok(container) = self.registry.get(&id) else {
                return;
            };
            if container.status.is_active() {
                self.registry
                    .compare_and_set_status(&id, container.status, ContainerStatus::Exited);
            }
            let _ = self.registry.update_runtime(&id, |rt| {
                rt.exit_code = code;
                rt.finished_at = Some(chrono::Utc::now());
                rt.process = None;
            });
            info!(container_id = %id, exit_code = ?code, "🏁 Container exited");
            log_container_event(&id, "die", &container.name);

            if !self.should_restart(&container, code) {
                return;
            }
            let attempt = container.runtime.restart_count;
            drop(slot);

            let backoff = self.settings.restart_backoff * 2u32.saturating_pow(attempt.min(6));
            tokio::time::sleep(backoff).await;
            self.restart_after_exit(&id, attempt).await;
        })
    }

    fn should_restart(&self, container: &Container, code: Option<i32>) -> bool {
        if container.runtime.stopped_by_user || container.runtime.restart_count >= self.settings.max_restarts {
            return false;
        }
        match container.spec.restart_policy {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure => code != Some(0),
        }
    }

    async fn restart_after_exit(&self, id: &ContainerId, attempt: u32) {
        let mut slot = self.lock(id).await;
        let Ok(container) = self.registry.get(id) else {
            return;
        };
        // anything else means someone acted on the container meanwhile
        if container.status != ContainerStatus::Exited || container.runtime.restart_count != attempt {
            return;
        }

        let _ = self.registry.update_runtime(id, |rt| rt.restart_count += 1);
        info!(container_id = %id, attempt = attempt + 1, "🔄 Restarting container per policy");
        if let Err(e) = self.launch(&mut slot, &container, ContainerStatus::Exited).await {
            warn!(container_id = %id, "Restart failed: {}", e);
        }
    }

    /// Stop a running or paused container: SIGTERM, then SIGKILL after the
    /// grace period. Stopping a stopped or exited container is a no-op.
    pub async fn stop(&self, id: &ContainerId) -> Result<Container> {
        self.registry.get(id)?;
        let mut slot = self.lock(id).await;
        let container = self.registry.get(id)?;

        match container.status {
            ContainerStatus::Stopped | ContainerStatus::Exited => return Ok(container),
            ContainerStatus::Running | ContainerStatus::Paused => {}
            status => {
                return Err(KeelError::invalid_state(id.as_str(), status, "container is not running"));
            }
        }

        let code = match slot.process.clone() {
            Some((handle, mut exit)) => {
                self.registry.update_runtime(id, |rt| rt.stopped_by_user = true)?;
                match self.terminate(id, handle, &mut exit, container.status).await {
                    Ok(code) => code,
                    Err(e) => {
                        let _ = self.registry.update_runtime(id, |rt| rt.stopped_by_user = false);
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        if !self
            .registry
            .compare_and_set_status(id, container.status, ContainerStatus::Stopped)
        {
            return Err(KeelError::Conflict(format!(
                "container {} changed state during stop",
                id.short()
            )));
        }
        slot.process = None;
        self.registry.update_runtime(id, |rt| {
            rt.exit_code = code;
            rt.finished_at = Some(chrono::Utc::now());
            rt.process = None;
        })?;
        drop(slot);

        log_container_event(id, "stop", &container.name);
        self.registry.get(id)
    }

    async fn terminate(
        &self,
        id: &ContainerId,
        handle: ProcessHandle,
        exit: &mut watch::Receiver<Option<i32>>,
        status: ContainerStatus,
    ) -> Result<Option<i32>> {
        info!(container_id = %id, "🛑 Stopping container");
        // a handle reaped meanwhile has already published its exit code
        let exited = *exit.borrow();
        if let Some(code) = exited {
            return Ok(Some(code));
        }
        match self.supervisor.signal(handle, Signal::Term).await {
            Ok(()) | Err(SupervisorError::UnknownHandle(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if status == ContainerStatus::Paused {
            match self.supervisor.resume(handle).await {
                Ok(()) | Err(SupervisorError::UnknownHandle(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Ok(code) = wait_exit(exit, self.settings.stop_grace_period).await {
            return Ok(code);
        }

        warn!(
            container_id = %id,
            "Container didn't respond to SIGTERM within {:?}, sending SIGKILL",
            self.settings.stop_grace_period
        );
        match self.supervisor.signal(handle, Signal::Kill).await {
            Ok(()) | Err(SupervisorError::UnknownHandle(_)) => {}
            Err(e) => return Err(e.into()),
        }

        wait_exit(exit, self.settings.kill_timeout).await.map_err(|_| {
            KeelError::backend(format!(
                "container {} did not exit after SIGKILL",
                id.short()
            ))
        })
    }

    pub async fn pause(&self, id: &ContainerId) -> Result<Container> {
        self.registry.get(id)?;
        let slot = self.lock(id).await;
        let container = self.registry.get(id)?;

        match container.status {
            ContainerStatus::Paused => return Ok(container),
            ContainerStatus::Running => {}
            status => {
                return Err(KeelError::invalid_state(id.as_str(), status, "only running containers can be paused"));
            }
        }
        let Some((handle, _)) = slot.process.as_ref() else {
            return Err(KeelError::invalid_state(id.as_str(), container.status, "no process attached"));
        };

        self.supervisor.pause(*handle).await?;
        if !self
            .registry
            .compare_and_set_status(id, ContainerStatus::Running, ContainerStatus::Paused)
        {
            warn!(container_id = %id, "Status moved while pausing, resuming process");
            let _ = self.supervisor.resume(*handle).await;
            return Err(KeelError::Conflict(format!("container {} changed state during pause", id.short())));
        }
        drop(slot);

        log_container_event(id, "pause", &container.name);
        self.registry.get(id)
    }

    pub async fn unpause(&self, id: &ContainerId) -> Result<Container> {
        self.registry.get(id)?;
        let slot = self.lock(id).await;
        let container = self.registry.get(id)?;

        match container.status {
            ContainerStatus::Running => return Ok(container),
            ContainerStatus::Paused => {}
            status => {
                return Err(KeelError::invalid_state(id.as_str(), status, "container is not paused"));
            }
        }
        let Some((handle, _)) = slot.process.as_ref() else {
            return Err(KeelError::invalid_state(id.as_str(), container.status, "no process attached"));
        };

        self.supervisor.resume(*handle).await?;
        if !self
            .registry
            .compare_and_set_status(id, ContainerStatus::Paused, ContainerStatus::Running)
        {
            return Err(KeelError::Conflict(format!("container {} changed state during unpause", id.short())));
        }
        drop(slot);

        log_container_event(id, "unpause", &container.name);
        self.registry.get(id)
    }

    /// Remove a container that is not running. The registry row goes away
    /// only after the supervisor has released its resources.
    pub async fn remove(&self, id: &ContainerId) -> Result<()> {
        self.registry.get(id)?;
        let slot = self.lock(id).await;
        let container = self.registry.get(id)?;

        let from = container.status;
        match from {
            ContainerStatus::Created | ContainerStatus::Stopped | ContainerStatus::Exited => {}
            ContainerStatus::Running | ContainerStatus::Paused => {
                return Err(KeelError::invalid_state(id.as_str(), from, "stop the container first"));
            }
            ContainerStatus::Removing => {
                return Err(KeelError::Conflict(format!("container {} is already being removed", id.short())));
            }
        }

        if !self.registry.compare_and_set_status(id, from, ContainerStatus::Removing) {
            return Err(KeelError::Conflict(format!("container {} changed state during remove", id.short())));
        }

        if let Err(e) = self.supervisor.release(id).await {
            error!(container_id = %id, "❌ Failed to release container resources: {}", e);
            self.registry
                .compare_and_set_status(id, ContainerStatus::Removing, from);
            return Err(KeelError::backend(e));
        }

        self.broker.forget(id);
        self.registry.remove(id)?;
        drop(slot);
        self.forget_slot(id);

        log_container_event(id, "destroy", &container.name);
        Ok(())
    }

    /// Stop every active container
    pub async fn shutdown(&self) {
        for container in self.registry.list() {
            if !container.status.is_active() {
                continue;
            }
            if let Err(e) = self.stop(&container.id).await {
                warn!(container_id = %container.id, "Failed to stop container during shutdown: {}", e);
            }
        }
        debug!("lifecycle engine shut down");
    }
}

/// Wait up to `limit` for the exit code. `Ok(None)` means the process is
/// gone but its status was lost.
async fn wait_exit(
    exit: &mut watch::Receiver<Option<i32>>,
    limit: Duration,
) -> std::result::Result<Option<i32>, tokio::time::error::Elapsed> {
    tokio::time::timeout(limit, async {
        exit.wait_for(Option::is_some).await.ok().and_then(|code| *code)
    })
    .await
}

fn validate_name(name: String) -> Result<String> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
    if valid {
        Ok(name)
    } else {
        Err(KeelError::backend(format!("invalid container name '{}'", name)))
    }
}

fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("keel_{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("web-1".to_string()).is_ok());
        assert!(validate_name("my_app.v2".to_string()).is_ok());
        assert!(validate_name("".to_string()).is_err());
        assert!(validate_name("-web".to_string()).is_err());
        assert!(validate_name("web app".to_string()).is_err());
    }

    #[test]
    fn test_generated_names_are_valid_and_distinct() {
        let a = generate_name();
        let b = generate_name();
        assert!(a.starts_with("keel_"));
        assert_eq!(a.len(), 13);
        assert_ne!(a, b);
        assert!(validate_name(a).is_ok());
    }
}
