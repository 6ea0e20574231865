//! Process supervisor: the only component that starts, signals and reaps OS
//! processes.
//!
//! Every spawned child is owned by a reaper task that waits on it and
//! publishes the exit code, so no child is ever left as a zombie. Callers
//! only ever see an opaque [`ProcessHandle`]; a handle can be waited on once,
//! after which it is deregistered.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backend::{ContainerBackend, MIN_MEMORY_BYTES, ProcessTarget, signal_group};
use super::{ProcessHandle, Signal};
use crate::error::SupervisorError;
use crate::registry::{Container, ContainerId, Image, PortMapping, Protocol, ResourceLimits};

/// Everything the backend needs to start a container's main process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub container_id: ContainerId,
    pub image: Image,
    /// Resolved argv: the container override, else the image default
    pub command: Vec<String>,
    /// Image environment overlaid with the container's own
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub limits: ResourceLimits,
}

impl LaunchSpec {
    pub fn new(container: &Container, image: &Image) -> Self {
        let command = if container.spec.command.is_empty() {
            image.command.clone()
        } else {
            container.spec.command.clone()
        };
        let mut env = image.env.clone();
        env.extend(container.spec.env.clone());

        Self {
            container_id: container.id.clone(),
            image: image.clone(),
            command,
            env,
            ports: container.spec.ports.clone(),
            limits: container.spec.limits.clone(),
        }
    }
}

/// A host helper process (docker CLI call, build script, ...)
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl TaskSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A freshly spawned process and its output pipes
#[derive(Debug)]
pub struct Spawned {
    pub handle: ProcessHandle,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    /// Becomes `Some(code)` once the reaper has collected the process
    pub exit: watch::Receiver<Option<i32>>,
}

/// Result of [`Supervisor::run_task`]
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub code: i32,
    pub stdout: String,
    /// Last lines written to stderr
    pub stderr_tail: String,
}

impl TaskOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessKind {
    Main,
    Exec,
    Task,
}

struct Entry {
    pid: u32,
    kind: ProcessKind,
    container: Option<ContainerId>,
    exit: watch::Receiver<Option<i32>>,
    waited: bool,
    ports: Vec<(u16, Protocol)>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<u64, Entry>,
    ports: HashMap<(u16, Protocol), ContainerId>,
}

impl Table {
    fn release_ports(&mut self, ports: &[(u16, Protocol)]) {
        for key in ports {
            self.ports.remove(key);
        }
    }
}

const STDERR_TAIL_LINES: usize = 20;

pub struct Supervisor {
    backend: Arc<dyn ContainerBackend>,
    table: Mutex<Table>,
    next_handle: AtomicU64,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            backend,
            table: Mutex::new(Table::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a container's main process.
    ///
    /// Declared host ports are claimed for the lifetime of the process; a
    /// port held by another container fails with `PortConflict`.
    pub async fn spawn(&self, spec: &LaunchSpec) -> Result<Spawned, SupervisorError> {
        if let Some(bytes) = spec.limits.memory_bytes {
            if bytes < MIN_MEMORY_BYTES {
                return Err(SupervisorError::ResourceLimit {
                    reason: format!(
                        "memory limit of {} bytes is below the minimum of {} bytes",
                        bytes, MIN_MEMORY_BYTES
                    ),
                });
            }
        }

        let ports = self.claim_ports(&spec.container_id, &spec.ports)?;

        let launched = async {
            self.backend.prepare(spec).await?;
            let cmd = self.backend.main_command(spec)?;
            self.launch(
                cmd,
                ProcessKind::Main,
                Some(spec.container_id.clone()),
                ports.clone(),
                spec.container_id.short(),
            )
        }
        .await;

        if launched.is_err() {
            self.table().release_ports(&ports);
        }
        let spawned = launched?;
        info!(
            container_id = %spec.container_id,
            handle = %spawned.handle,
            backend = %self.backend.kind(),
            "🚀 Spawned container process"
        );
        Ok(spawned)
    }

    /// Run `argv` inside a running container
    pub fn spawn_exec(&self, spec: &LaunchSpec, argv: &[String]) -> Result<Spawned, SupervisorError> {
        let cmd = self.backend.exec_command(spec, argv)?;
        self.launch(
            cmd,
            ProcessKind::Exec,
            Some(spec.container_id.clone()),
            Vec::new(),
            &argv.join(" "),
        )
    }

    /// Start a host helper process
    pub fn spawn_task(&self, task: &TaskSpec) -> Result<Spawned, SupervisorError> {
        let mut cmd = Command::new(&task.program);
        cmd.args(&task.args).envs(&task.env);
        if let Some(ref dir) = task.cwd {
            cmd.current_dir(dir);
        }
        self.launch(cmd, ProcessKind::Task, None, Vec::new(), &task.describe())
    }

    /// Run a helper process to completion, feeding each output line to
    /// `on_line`. Dropping the returned future kills the process.
    pub async fn run_task<F>(
        self: &Arc<Self>,
        task: &TaskSpec,
        mut on_line: F,
    ) -> Result<TaskOutput, SupervisorError>
    where
        F: FnMut(&str) + Send,
    {
        let spawned = self.spawn_task(task)?;
        let mut guard = TaskGuard {
            supervisor: Arc::clone(self),
            handle: Some(spawned.handle),
        };

        let mut out = BufReader::new(spawned.stdout).lines();
        let mut err = BufReader::new(spawned.stderr).lines();
        let (mut out_open, mut err_open) = (true, true);
        let mut stdout = String::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        while out_open || err_open {
            tokio::select! {
                line = out.next_line(), if out_open => match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        stdout.push_str(&line);
                        stdout.push('\n');
                    }
                    _ => out_open = false,
                },
                line = err.next_line(), if err_open => match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    _ => err_open = false,
                },
            }
        }

        let code = self.wait(spawned.handle).await?;
        guard.handle = None;

        Ok(TaskOutput {
            code,
            stdout,
            stderr_tail: Vec::from(tail).join("\n"),
        })
    }

    fn claim_ports(
        &self,
        owner: &ContainerId,
        mappings: &[PortMapping],
    ) -> Result<Vec<(u16, Protocol)>, SupervisorError> {
        let mut table = self.table();
        for mapping in mappings {
            if let Some(holder) = table.ports.get(&(mapping.host_port, mapping.protocol)) {
                if holder != owner {
                    return Err(SupervisorError::PortConflict {
                        port: mapping.host_port,
                        holder: holder.short().to_string(),
                    });
                }
            }
        }

        let claimed: Vec<(u16, Protocol)> = mappings
            .iter()
            .map(|m| (m.host_port, m.protocol))
            .collect();
        for key in &claimed {
            table.ports.insert(*key, owner.clone());
        }
        Ok(claimed)
    }

    fn launch(
        &self,
        mut cmd: Command,
        kind: ProcessKind,
        container: Option<ContainerId>,
        ports: Vec<(u16, Protocol)>,
        what: &str,
    ) -> Result<Spawned, SupervisorError> {
        let spawn_failed = |reason: String| SupervisorError::SpawnFailed {
            what: what.to_string(),
            reason,
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_failed("process exited before it was registered".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed("stderr was not captured".to_string()))?;

        let handle = ProcessHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                Err(e) => {
                    warn!(%handle, "Failed to reap process: {}", e);
                    255
                }
            };
            debug!(%handle, pid, code, "process exited");
            let _ = exit_tx.send(Some(code));
        });

        self.table().entries.insert(
            handle.0,
            Entry {
                pid,
                kind,
                container,
                exit: exit_rx.clone(),
                waited: false,
                ports,
            },
        );

        Ok(Spawned {
            handle,
            stdout,
            stderr,
            exit: exit_rx,
        })
    }

    /// Suspend until the process exits and return its exit code (128+n for
    /// death by signal n). Succeeds once per handle; the handle is gone
    /// afterwards.
    pub async fn wait(&self, handle: ProcessHandle) -> Result<i32, SupervisorError> {
        let mut exit = {
            let mut table = self.table();
            let entry = table
                .entries
                .get_mut(&handle.0)
                .ok_or(SupervisorError::UnknownHandle(handle.0))?;
            if entry.waited {
                return Err(SupervisorError::AlreadyWaited(handle.0));
            }
            entry.waited = true;
            entry.exit.clone()
        };

        let mut claim = WaitClaim {
            table: &self.table,
            handle,
            finished: false,
        };
        let code = exit.wait_for(Option::is_some).await.ok().and_then(|code| *code);
        claim.finished = true;

        let mut table = self.table();
        if let Some(entry) = table.entries.remove(&handle.0) {
            table.release_ports(&entry.ports);
        }
        drop(table);

        code.ok_or_else(|| SupervisorError::Backend {
            backend: self.backend.kind().to_string(),
            reason: format!("reaper for {} stopped without an exit status", handle),
        })
    }

    pub fn is_alive(&self, handle: ProcessHandle) -> bool {
        self.table()
            .entries
            .get(&handle.0)
            .map(|entry| entry.exit.borrow().is_none())
            .unwrap_or(false)
    }

    /// What a signal needs, or `None` once the process has exited
    fn live(&self, handle: ProcessHandle) -> Result<Option<(ProcessKind, ProcessTarget)>, SupervisorError> {
        let table = self.table();
        let entry = table
            .entries
            .get(&handle.0)
            .ok_or(SupervisorError::UnknownHandle(handle.0))?;
        if entry.exit.borrow().is_some() {
            return Ok(None);
        }
        Ok(Some((
            entry.kind,
            ProcessTarget {
                pid: entry.pid,
                container: entry.container.clone(),
            },
        )))
    }

    /// Deliver a signal. Signalling an exited process is a no-op.
    pub async fn signal(&self, handle: ProcessHandle, signal: Signal) -> Result<(), SupervisorError> {
        let Some((kind, target)) = self.live(handle)? else {
            return Ok(());
        };
        debug!(%handle, %signal, "signalling process");
        match kind {
            ProcessKind::Main => self.backend.signal(&target, signal).await,
            ProcessKind::Exec | ProcessKind::Task => signal_group(target.pid, signal),
        }
    }

    pub async fn pause(&self, handle: ProcessHandle) -> Result<(), SupervisorError> {
        match self.live(handle)? {
            Some((ProcessKind::Main, target)) => self.backend.pause(&target).await,
            Some((_, target)) => signal_group(target.pid, Signal::Stop),
            None => Ok(()),
        }
    }

    pub async fn resume(&self, handle: ProcessHandle) -> Result<(), SupervisorError> {
        match self.live(handle)? {
            Some((ProcessKind::Main, target)) => self.backend.resume(&target).await,
            Some((_, target)) => signal_group(target.pid, Signal::Cont),
            None => Ok(()),
        }
    }

    /// Release every backend resource held for a container without live
    /// processes
    pub async fn release(&self, container: &ContainerId) -> Result<(), SupervisorError> {
        let live = self.table().entries.values().any(|entry| {
            entry.container.as_ref() == Some(container)
                && entry.kind == ProcessKind::Main
                && entry.exit.borrow().is_none()
        });
        if live {
            return Err(SupervisorError::Backend {
                backend: self.backend.kind().to_string(),
                reason: format!("container {} still has a live process", container.short()),
            });
        }

        self.backend.release(container).await?;
        self.table().ports.retain(|_, holder| holder != container);
        Ok(())
    }

    /// Number of registered (not yet waited) processes
    pub fn tracked(&self) -> usize {
        self.table().entries.len()
    }

    /// Kill every process still alive
    pub async fn shutdown(&self) {
        let live: Vec<ProcessHandle> = self
            .table()
            .entries
            .iter()
            .filter(|(_, entry)| entry.exit.borrow().is_none())
            .map(|(id, _)| ProcessHandle(*id))
            .collect();

        if !live.is_empty() {
            info!("🛑 Killing {} remaining processes", live.len());
        }
        for handle in live {
            if let Err(e) = self.signal(handle, Signal::Kill).await {
                warn!(%handle, "Failed to kill process during shutdown: {}", e);
            }
        }
    }
}

/// Re-arms a handle for waiting if the waiting future is dropped early
struct WaitClaim<'a> {
    table: &'a Mutex<Table>,
    handle: ProcessHandle,
    finished: bool,
}

impl Drop for WaitClaim<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = table.entries.get_mut(&self.handle.0) {
            entry.waited = false;
        }
    }
}

/// Kills and reaps a helper process whose driver went away
struct TaskGuard {
    supervisor: Arc<Supervisor>,
    handle: Option<ProcessHandle>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let supervisor = Arc::clone(&self.supervisor);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = supervisor.signal(handle, Signal::Kill).await;
                let _ = supervisor.wait(handle).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelError;
    use crate::registry::ContainerSpec;
    use crate::runtime::{BlobStore, HostProcessBackend};
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> Arc<Supervisor> {
        let blobs = Arc::new(BlobStore::new(dir.path().join("blobs")).unwrap());
        let backend = HostProcessBackend::new(dir.path().join("containers"), blobs);
        Arc::new(Supervisor::new(Arc::new(backend)))
    }

    fn launch_spec(command: &str, ports: &[&str]) -> LaunchSpec {
        let image = Image {
            id: "sha256:00ff".to_string(),
            repository: "test".to_string(),
            tag: "latest".to_string(),
            size: 0,
            created_at: chrono::Utc::now(),
            command: Vec::new(),
            env: BTreeMap::new(),
            in_use: false,
        };
        let container = Container::new(
            "sup",
            image.id.clone(),
            ContainerSpec {
                image: "test".to_string(),
                command: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
                ports: ports.iter().map(|p| p.parse().unwrap()).collect(),
                ..Default::default()
            },
        );
        LaunchSpec::new(&container, &image)
    }

    fn shell(script: &str) -> TaskSpec {
        TaskSpec::new("sh").args(["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_run_task_collects_output() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let mut lines = Vec::new();
        let output = sup
            .run_task(&shell("echo one; echo two >&2; exit 4"), |line| {
                lines.push(line.to_string())
            })
            .await
            .unwrap();

        assert_eq!(output.code, 4);
        assert!(!output.success());
        assert_eq!(output.stdout, "one\n");
        assert_eq!(output.stderr_tail, "two");
        lines.sort();
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(sup.tracked(), 0);
    }

    #[tokio::test]
    async fn test_wait_succeeds_once() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let spawned = sup.spawn_task(&shell("exit 2")).unwrap();
        assert_eq!(sup.wait(spawned.handle).await.unwrap(), 2);
        assert!(matches!(
            sup.wait(spawned.handle).await,
            Err(SupervisorError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_second_concurrent_wait_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let handle = sup.spawn_task(&shell("sleep 0.3")).unwrap().handle;
        let first = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.wait(handle).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(matches!(
            sup.wait(handle).await,
            Err(SupervisorError::AlreadyWaited(_))
        ));
        assert_eq!(first.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_signal_death_reports_128_plus_n() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let spawned = sup.spawn_task(&shell("sleep 30")).unwrap();
        assert!(sup.is_alive(spawned.handle));
        sup.signal(spawned.handle, Signal::Term).await.unwrap();
        assert_eq!(sup.wait(spawned.handle).await.unwrap(), 143);
    }

    #[tokio::test]
    async fn test_signal_after_exit_is_noop() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let mut spawned = sup.spawn_task(&shell("true")).unwrap();
        spawned.exit.wait_for(Option::is_some).await.unwrap();
        sup.signal(spawned.handle, Signal::Kill).await.unwrap();
        assert_eq!(sup.wait(spawned.handle).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_port_claims() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let first = sup.spawn(&launch_spec("sleep 30", &["18181:80"])).await.unwrap();

        let err = sup
            .spawn(&launch_spec("sleep 30", &["18181:8080"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::PortConflict { port: 18181, .. }));
        assert_eq!(KeelError::from(err).kind(), crate::error::ErrorKind::Conflict);

        // a different protocol is a different claim
        let udp = sup
            .spawn(&launch_spec("sleep 30", &["18181:80/udp"]))
            .await
            .unwrap();

        sup.signal(first.handle, Signal::Kill).await.unwrap();
        sup.wait(first.handle).await.unwrap();
        let again = sup.spawn(&launch_spec("sleep 30", &["18181:80"])).await.unwrap();

        sup.shutdown().await;
        for handle in [udp.handle, again.handle] {
            assert_eq!(sup.wait(handle).await.unwrap(), 137);
        }
    }

    #[tokio::test]
    async fn test_memory_floor() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let mut spec = launch_spec("true", &[]);
        spec.limits.memory_bytes = Some(1024 * 1024);
        assert!(matches!(
            sup.spawn(&spec).await,
            Err(SupervisorError::ResourceLimit { .. })
        ));
        assert_eq!(sup.tracked(), 0);
    }

    #[tokio::test]
    async fn test_dropped_task_is_killed() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);

        let spec = shell("sleep 30");
        let task = sup.run_task(&spec, |_| {});
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(100), task)
                .await
                .is_err()
        );

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while sup.tracked() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "task was never reaped");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}
