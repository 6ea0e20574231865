//! Image puller and builder front end.
//!
//! Pulls and builds run as background tasks keyed by operation and
//! `repository:tag`. A second request for a reference already in flight joins
//! the running task and receives the same outcome. Only a finished, verified
//! image is ever registered; failed and cancelled operations clean up after
//! themselves and report a terminal progress event.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::builds::ImageBuilder;
use crate::error::{ErrorKind, KeelError, Result};
use crate::monitoring::log_image_event;
use crate::registry::{Image, ImageReference, Registry};
use crate::runtime::BlobStore;

pub mod sources;

pub use sources::{DockerCliSource, ImageSource, MirrorSource, NoMirrorSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Pull,
    Build,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pull => f.write_str("pull"),
            Self::Build => f.write_str("build"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Progress of one pull or build; `percent` never decreases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub operation: Operation,
    pub reference: String,
    pub percent: u8,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

struct ReporterInner {
    events: broadcast::Sender<ProgressEvent>,
    operation: Operation,
    reference: String,
    percent: AtomicU8,
    finished: AtomicBool,
}

/// Handed to sources and builders to publish progress
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

impl ProgressReporter {
    pub fn new(
        events: broadcast::Sender<ProgressEvent>,
        operation: Operation,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                events,
                operation,
                reference: reference.into(),
                percent: AtomicU8::new(0),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Publish progress. Values above 100 are clamped and values below the
    /// current level are raised to it.
    pub fn report(&self, percent: u8, detail: Option<String>) {
        if self.inner.finished.load(Ordering::SeqCst) {
            return;
        }
        let percent = percent.min(100);
        let previous = self.inner.percent.fetch_max(percent, Ordering::SeqCst);
        self.emit(previous.max(percent), Phase::Running, detail);
    }

    /// Publish an output line without moving the percentage
    pub fn line(&self, line: &str) {
        self.report(self.percent(), Some(line.to_string()));
    }

    pub fn percent(&self) -> u8 {
        self.inner.percent.load(Ordering::SeqCst)
    }

    fn finish(&self, phase: Phase, detail: Option<String>) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let percent = if phase == Phase::Completed {
            self.inner.percent.store(100, Ordering::SeqCst);
            100
        } else {
            self.percent()
        };
        self.emit(percent, phase, detail);
    }

    fn emit(&self, percent: u8, phase: Phase, detail: Option<String>) {
        // nobody listening is fine
        let _ = self.inner.events.send(ProgressEvent {
            operation: self.inner.operation,
            reference: self.inner.reference.clone(),
            percent,
            phase,
            detail,
        });
    }
}

/// What a source or builder produced, before it is registered
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub id: String,
    pub size: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl FetchedImage {
    pub fn into_image(self, reference: &ImageReference) -> Image {
        Image {
            id: self.id,
            repository: reference.repository.clone(),
            tag: reference.tag.clone(),
            size: self.size,
            created_at: self.created_at,
            command: self.command,
            env: self.env,
            in_use: false,
        }
    }
}

/// Failure shared between every caller joined on one operation
#[derive(Debug, Clone)]
struct SharedFailure {
    kind: ErrorKind,
    message: String,
}

impl SharedFailure {
    fn from_error(err: &KeelError) -> Self {
        let message = match err {
            KeelError::NotFound { id, .. } => id.clone(),
            KeelError::Cancelled(m) | KeelError::Conflict(m) | KeelError::BackendFailure(m) => m.clone(),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
        }
    }
}

impl From<SharedFailure> for KeelError {
    fn from(failure: SharedFailure) -> Self {
        match failure.kind {
            ErrorKind::NotFound => KeelError::image_not_found(failure.message),
            ErrorKind::Cancelled => KeelError::Cancelled(failure.message),
            ErrorKind::Conflict => KeelError::Conflict(failure.message),
            ErrorKind::InvalidState | ErrorKind::ResourceInUse | ErrorKind::BackendFailure => {
                KeelError::BackendFailure(failure.message)
            }
        }
    }
}

type Outcome = std::result::Result<Image, SharedFailure>;
type InflightKey = (Operation, String);

struct Inflight {
    outcome: watch::Receiver<Option<Outcome>>,
    cancel: watch::Sender<bool>,
}

type InflightMap = Arc<Mutex<HashMap<InflightKey, Inflight>>>;

fn lock_inflight(map: &InflightMap) -> MutexGuard<'_, HashMap<InflightKey, Inflight>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Job {
    Pull(Arc<dyn ImageSource>),
    Build(Arc<dyn ImageBuilder>, PathBuf),
}

impl Job {
    async fn run(&self, reference: &ImageReference, progress: &ProgressReporter) -> Result<FetchedImage> {
        match self {
            Self::Pull(source) => source.fetch(reference, progress).await,
            Self::Build(builder, context) => builder.build(context, reference, progress).await,
        }
    }

    async fn discard(&self, reference: &ImageReference) {
        match self {
            Self::Pull(source) => source.discard(reference).await,
            Self::Build(builder, _) => builder.discard(reference).await,
        }
    }
}

pub struct ImageService {
    registry: Arc<Registry>,
    blobs: Arc<BlobStore>,
    source: Arc<dyn ImageSource>,
    builder: Arc<dyn ImageBuilder>,
    progress: broadcast::Sender<ProgressEvent>,
    inflight: InflightMap,
}

impl ImageService {
    pub fn new(
        registry: Arc<Registry>,
        blobs: Arc<BlobStore>,
        source: Arc<dyn ImageSource>,
        builder: Arc<dyn ImageBuilder>,
        event_capacity: usize,
    ) -> Self {
        let (progress, _) = broadcast::channel(event_capacity.max(1));
        Self {
            registry,
            blobs,
            source,
            builder,
            progress,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn list(&self) -> Vec<Image> {
        self.registry.list_images()
    }

    /// Fetch `repository:tag` from the configured source and register it
    pub async fn pull(&self, repository: &str, tag: &str) -> Result<Image> {
        let reference = ImageReference::new(repository, tag)?;
        self.track(Operation::Pull, reference, Job::Pull(Arc::clone(&self.source)))
            .await
    }

    /// Build the context directory at `context` and register it as `tag`
    pub async fn build(&self, context: impl Into<PathBuf>, tag: &str) -> Result<Image> {
        let context = context.into();
        let reference = ImageReference::parse(tag)?;
        if !tokio::fs::metadata(&context)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(KeelError::NotFound {
                entity: "build context",
                id: context.display().to_string(),
            });
        }
        self.track(
            Operation::Build,
            reference,
            Job::Build(Arc::clone(&self.builder), context),
        )
        .await
    }

    /// Cancel an in-flight operation. Returns false if none was running.
    pub fn cancel(&self, operation: Operation, reference: &ImageReference) -> bool {
        let inflight = lock_inflight(&self.inflight);
        match inflight.get(&(operation, reference.to_string())) {
            Some(running) => {
                info!("⏹️  Cancelling {} of {}", operation, reference);
                running.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, operation: Operation, reference: &ImageReference) -> bool {
        lock_inflight(&self.inflight).contains_key(&(operation, reference.to_string()))
    }

    /// Unregister an image (by `repo:tag` or content id) and drop its data
    /// once no tag refers to it any more
    pub async fn remove(&self, reference: &str) -> Result<Vec<Image>> {
        let removed = self.registry.remove_image(reference)?;
        for image in &removed {
            if let Err(e) = self.source.remove(image).await {
                warn!("Failed to clean up image data for {}: {}", image.key(), e);
            }
            if !self.registry.has_image_id(&image.id) {
                drop_blob(&self.blobs, image).await;
            }
            log_image_event(&image.key(), "delete", Some(&image.id));
        }
        Ok(removed)
    }

    async fn track(&self, operation: Operation, reference: ImageReference, job: Job) -> Result<Image> {
        let key = (operation, reference.to_string());

        let mut outcome = {
            let mut inflight = lock_inflight(&self.inflight);
            match inflight.get(&key) {
                Some(running) => {
                    debug!("joining in-flight {} of {}", operation, reference);
                    running.outcome.clone()
                }
                None => {
                    let (outcome_tx, outcome_rx) = watch::channel(None);
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    inflight.insert(
                        key.clone(),
                        Inflight {
                            outcome: outcome_rx.clone(),
                            cancel: cancel_tx,
                        },
                    );

                    let task = JobTask {
                        registry: Arc::clone(&self.registry),
                        blobs: Arc::clone(&self.blobs),
                        inflight: Arc::clone(&self.inflight),
                        progress: ProgressReporter::new(self.progress.clone(), operation, &key.1),
                        key,
                        reference,
                        job,
                    };
                    tokio::spawn(task.run(outcome_tx, cancel_rx));
                    outcome_rx
                }
            }
        };

        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| KeelError::backend("image task ended without a result"))?
            .clone();

        match finished {
            Some(Ok(image)) => Ok(image),
            Some(Err(failure)) => Err(failure.into()),
            None => Err(KeelError::backend("image task ended without a result")),
        }
    }
}

/// Delete the stored archive of an image no tag refers to any more
async fn drop_blob(blobs: &BlobStore, image: &Image) {
    match blobs.delete(&image.id).await {
        Ok(()) => debug!(image = %image.id, "image data released"),
        Err(e) => warn!("Failed to delete archive of {}: {}", image.id, e),
    }
}

struct JobTask {
    registry: Arc<Registry>,
    blobs: Arc<BlobStore>,
    inflight: InflightMap,
    progress: ProgressReporter,
    key: InflightKey,
    reference: ImageReference,
    job: Job,
}

impl JobTask {
    async fn run(self, outcome: watch::Sender<Option<Outcome>>, mut cancel: watch::Receiver<bool>) {
        let (operation, ref name) = self.key;
        info!("📦 Starting {} of {}", operation, name);
        self.progress.report(0, Some(format!("{} started", operation)));

        let result = tokio::select! {
            result = self.job.run(&self.reference, &self.progress) => result,
            Ok(_) = cancel.wait_for(|cancelled| *cancelled) => {
                Err(KeelError::Cancelled(format!("{} of {}", operation, name)))
            }
        };

        let shared = match result {
            Ok(fetched) => {
                let image = fetched.into_image(&self.reference);
                if let Some(displaced) = self.registry.upsert_image(image.clone()) {
                    drop_blob(&self.blobs, &displaced).await;
                }
                self.progress.finish(Phase::Completed, Some(image.id.clone()));
                log_image_event(name, operation_event(operation), Some(&image.id));
                Ok(image)
            }
            Err(e) => {
                self.job.discard(&self.reference).await;
                let phase = if e.kind() == ErrorKind::Cancelled {
                    Phase::Cancelled
                } else {
                    Phase::Failed
                };
                warn!("❌ {} of {} did not complete: {}", operation, name, e);
                self.progress.finish(phase, Some(e.to_string()));
                Err(SharedFailure::from_error(&e))
            }
        };

        outcome.send_replace(Some(shared));
        lock_inflight(&self.inflight).remove(&self.key);
    }
}

fn operation_event(operation: Operation) -> &'static str {
    match operation {
        Operation::Pull => "pull",
        Operation::Build => "build",
    }
}
