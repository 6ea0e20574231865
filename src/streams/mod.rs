//! Log and exec stream broker.
//!
//! Each container has a log hub: a bounded ring of recent [`LogEntry`] lines
//! plus a live broadcast channel fed by the current main process's pipes.
//! Subscribers get the ring contents followed by live lines until the process
//! closes both pipes or the subscriber drops its stream.

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{KeelError, Result};
use crate::registry::{ContainerId, ContainerStatus, Registry};
use crate::runtime::{LaunchSpec, ProcessHandle, Signal, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of container output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamKind,
    pub line: String,
}

/// Lazily produced log lines for one subscriber
pub type LogFeed = BoxStream<'static, LogEntry>;

#[derive(Default)]
struct LogHub {
    ring: VecDeque<LogEntry>,
    live: Option<broadcast::Sender<LogEntry>>,
    /// Bumped per attached process; stale pumps are ignored
    epoch: u64,
    open_pipes: u8,
}

pub struct StreamBroker {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    hubs: Mutex<HashMap<ContainerId, LogHub>>,
    buffer_lines: usize,
}

impl StreamBroker {
    pub fn new(registry: Arc<Registry>, supervisor: Arc<Supervisor>, buffer_lines: usize) -> Self {
        Self {
            registry,
            supervisor,
            hubs: Mutex::new(HashMap::new()),
            buffer_lines: buffer_lines.max(1),
        }
    }

    /// Lines a live subscriber may fall behind before it starts losing them
    pub fn live_capacity(&self) -> usize {
        self.buffer_lines.max(64)
    }

    fn hubs(&self) -> MutexGuard<'_, HashMap<ContainerId, LogHub>> {
        self.hubs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start collecting output of a freshly spawned main process
    pub fn attach_process(self: &Arc<Self>, id: &ContainerId, stdout: ChildStdout, stderr: ChildStderr) {
        let epoch = {
            let mut hubs = self.hubs();
            let hub = hubs.entry(id.clone()).or_default();
            let (tx, _) = broadcast::channel(self.live_capacity());
            hub.live = Some(tx);
            hub.epoch += 1;
            hub.open_pipes = 2;
            hub.epoch
        };

        tokio::spawn(Arc::clone(self).pump(id.clone(), epoch, StreamKind::Stdout, stdout));
        tokio::spawn(Arc::clone(self).pump(id.clone(), epoch, StreamKind::Stderr, stderr));
    }

    async fn pump<R>(self: Arc<Self>, id: ContainerId, epoch: u64, stream: StreamKind, pipe: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    self.publish(
                        &id,
                        epoch,
                        LogEntry {
                            timestamp: chrono::Utc::now(),
                            stream,
                            line: String::from_utf8_lossy(&buf).into_owned(),
                        },
                    );
                }
                Err(e) => {
                    warn!(container_id = %id, "Log pipe read failed: {}", e);
                    break;
                }
            }
        }
        self.pipe_closed(&id, epoch);
    }

    fn publish(&self, id: &ContainerId, epoch: u64, entry: LogEntry) {
        let mut hubs = self.hubs();
        let Some(hub) = hubs.get_mut(id) else {
            return;
        };
        if hub.ring.len() == self.buffer_lines {
            hub.ring.pop_front();
        }
        hub.ring.push_back(entry.clone());
        if hub.epoch == epoch {
            if let Some(ref live) = hub.live {
                let _ = live.send(entry);
            }
        }
    }

    fn pipe_closed(&self, id: &ContainerId, epoch: u64) {
        let mut hubs = self.hubs();
        if let Some(hub) = hubs.get_mut(id) {
            if hub.epoch == epoch {
                hub.open_pipes = hub.open_pipes.saturating_sub(1);
                if hub.open_pipes == 0 {
                    debug!(container_id = %id, "log stream closed");
                    hub.live = None;
                }
            }
        }
    }

    /// Subscribe to a container's output: buffered lines first, then live
    /// lines until the process exits or the returned stream is dropped.
    ///
    /// Each subscriber gets every line as long as it keeps up. One that
    /// falls more than [`live_capacity`](Self::live_capacity) lines behind
    /// loses the oldest unread lines; the skip is logged and the stream
    /// resumes with the oldest line still held.
    pub fn attach_logs(&self, id: &ContainerId) -> Result<LogFeed> {
        self.registry.get(id)?;

        let (backlog, live) = {
            let hubs = self.hubs();
            match hubs.get(id) {
                Some(hub) => (
                    hub.ring.iter().cloned().collect::<Vec<_>>(),
                    hub.live.as_ref().map(broadcast::Sender::subscribe),
                ),
                None => (Vec::new(), None),
            }
        };

        let follow = stream::unfold(live, |live| async move {
            let mut rx = live?;
            loop {
                match rx.recv().await {
                    Ok(entry) => return Some((entry, Some(rx))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Log subscriber fell behind, skipped {} lines", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(backlog).chain(follow).boxed())
    }

    /// Buffered lines only
    pub fn recent_logs(&self, id: &ContainerId) -> Vec<LogEntry> {
        self.hubs()
            .get(id)
            .map(|hub| hub.ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything kept for a removed container
    pub fn forget(&self, id: &ContainerId) {
        self.hubs().remove(id);
    }

    /// Run `argv` inside a running container.
    ///
    /// Fails with `InvalidState` unless the container is running. Dropping
    /// the returned stream kills the command.
    pub async fn exec(&self, id: &ContainerId, argv: Vec<String>) -> Result<ExecStream> {
        let container = self.registry.get(id)?;
        if container.status != ContainerStatus::Running || container.runtime.process.is_none() {
            return Err(KeelError::invalid_state(
                id.as_str(),
                container.status,
                "exec requires a running container",
            ));
        }
        if argv.is_empty() {
            return Err(KeelError::backend("exec requires a command"));
        }

        let image = self.registry.get_image(&container.image_id)?;
        let spec = LaunchSpec::new(&container, &image);
        let spawned = self.supervisor.spawn_exec(&spec, &argv)?;
        let handle = spawned.handle;
        debug!(container_id = %id, %handle, "exec started: {}", argv.join(" "));

        let (tx, rx) = mpsc::channel(64);
        let supervisor = Arc::clone(&self.supervisor);

        tokio::spawn(async move {
            let forward = async {
                tokio::join!(
                    forward_chunks(spawned.stdout, tx.clone(), ExecEvent::Stdout),
                    forward_chunks(spawned.stderr, tx.clone(), ExecEvent::Stderr),
                )
            };
            tokio::select! {
                _ = forward => {}
                _ = tx.closed() => {
                    debug!(%handle, "exec stream dropped, killing command");
                    kill_exec(&supervisor, handle).await;
                }
            }

            // the command may outlive its pipes
            let wait = supervisor.wait(handle);
            tokio::pin!(wait);
            let waited = tokio::select! {
                waited = &mut wait => waited,
                _ = tx.closed() => {
                    debug!(%handle, "exec stream dropped after output closed, killing command");
                    kill_exec(&supervisor, handle).await;
                    wait.await
                }
            };

            match waited {
                Ok(code) => {
                    let _ = tx.send(ExecEvent::Exit(code)).await;
                }
                Err(e) => warn!(%handle, "Failed to wait for exec process: {}", e),
            }
        });

        Ok(ExecStream { rx })
    }
}

async fn kill_exec(supervisor: &Supervisor, handle: ProcessHandle) {
    if let Err(e) = supervisor.signal(handle, Signal::Kill).await {
        warn!(%handle, "Failed to kill exec process: {}", e);
    }
}

async fn forward_chunks<R>(mut pipe: R, tx: mpsc::Sender<ExecEvent>, wrap: fn(Bytes) -> ExecEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(wrap(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Output of an exec'd command; always ends with [`ExecEvent::Exit`] unless
/// the command could not be reaped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

pub struct ExecStream {
    rx: mpsc::Receiver<ExecEvent>,
}

impl Stream for ExecStream {
    type Item = ExecEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Container, ContainerSpec, Image};
    use crate::runtime::{BlobStore, HostProcessBackend};
    use tempfile::TempDir;

    fn broker(dir: &TempDir, buffer_lines: usize) -> (Arc<StreamBroker>, ContainerId) {
        let registry = Arc::new(Registry::new(16));
        registry.upsert_image(Image {
            id: "sha256:aaaa1111".to_string(),
            repository: "alpine".to_string(),
            tag: "latest".to_string(),
            size: 0,
            created_at: chrono::Utc::now(),
            command: vec![],
            env: Default::default(),
            in_use: false,
        });
        let container = Container::new("logs", "sha256:aaaa1111", ContainerSpec::default());
        registry.upsert(container.clone()).unwrap();

        let blobs = Arc::new(BlobStore::new(dir.path().join("images")).unwrap());
        let backend = Arc::new(HostProcessBackend::new(dir.path().join("containers"), blobs));
        let supervisor = Arc::new(Supervisor::new(backend));
        (
            Arc::new(StreamBroker::new(registry, supervisor, buffer_lines)),
            container.id,
        )
    }

    fn open_hub(broker: &StreamBroker, id: &ContainerId) -> u64 {
        let mut hubs = broker.hubs();
        let hub = hubs.entry(id.clone()).or_default();
        let (tx, _) = broadcast::channel(broker.live_capacity());
        hub.live = Some(tx);
        hub.epoch += 1;
        hub.open_pipes = 2;
        hub.epoch
    }

    fn line(text: String) -> LogEntry {
        LogEntry {
            timestamp: chrono::Utc::now(),
            stream: StreamKind::Stdout,
            line: text,
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_newest_lines() {
        let dir = TempDir::new().unwrap();
        let (broker, id) = broker(&dir, 8);
        let epoch = open_hub(&broker, &id);
        let capacity = broker.live_capacity();
        assert_eq!(capacity, 64);

        let feed = broker.attach_logs(&id).unwrap();
        for n in 0..100 {
            broker.publish(&id, epoch, line(n.to_string()));
        }
        broker.pipe_closed(&id, epoch);
        broker.pipe_closed(&id, epoch);

        let lines: Vec<String> = feed.map(|e| e.line).collect().await;
        assert_eq!(lines.len(), capacity);
        assert_eq!(lines.first().map(String::as_str), Some("36"));
        assert_eq!(lines.last().map(String::as_str), Some("99"));

        // the ring keeps only the configured backlog
        let recent = broker.recent_logs(&id);
        assert_eq!(recent.len(), 8);
        assert_eq!(recent[0].line, "92");
    }

    #[tokio::test]
    async fn test_subscriber_within_capacity_sees_every_line() {
        let dir = TempDir::new().unwrap();
        let (broker, id) = broker(&dir, 8);
        let epoch = open_hub(&broker, &id);

        let feed = broker.attach_logs(&id).unwrap();
        for n in 0..broker.live_capacity() {
            broker.publish(&id, epoch, line(n.to_string()));
        }
        broker.pipe_closed(&id, epoch);
        broker.pipe_closed(&id, epoch);

        let lines: Vec<String> = feed.map(|e| e.line).collect().await;
        let expected: Vec<String> = (0..broker.live_capacity()).map(|n| n.to_string()).collect();
        assert_eq!(lines, expected);
    }
}
