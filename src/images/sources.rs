use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{FetchedImage, ProgressReporter};
use crate::error::{KeelError, Result};
use crate::registry::{Image, ImageReference};
use crate::runtime::{BlobStore, Supervisor, TaskSpec};

/// Where pulled images come from
#[async_trait]
pub trait ImageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch and verify an image. Must not leave anything usable behind on
    /// error; the caller registers the result.
    async fn fetch(&self, reference: &ImageReference, progress: &ProgressReporter) -> Result<FetchedImage>;

    /// Best-effort cleanup after a failed or cancelled fetch
    async fn discard(&self, _reference: &ImageReference) {}

    /// Drop data the source keeps outside the blob store for an
    /// unregistered tag
    async fn remove(&self, _image: &Image) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Archive mirror
// =============================================================================

/// Downloads `{base}/{repository}/{tag}.tar.gz` into the blob store
pub struct MirrorSource {
    client: reqwest::Client,
    base_url: String,
    blobs: Arc<BlobStore>,
    retries: u32,
}

enum Attempt {
    Retry(KeelError),
    Fatal(KeelError),
}

impl From<KeelError> for Attempt {
    fn from(err: KeelError) -> Self {
        Attempt::Fatal(err)
    }
}

impl MirrorSource {
    pub fn new(base_url: impl Into<String>, blobs: Arc<BlobStore>, retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            blobs,
            retries: retries.max(1),
        }
    }

    pub fn archive_url(&self, reference: &ImageReference) -> String {
        format!(
            "{}/{}/{}.tar.gz",
            self.base_url.trim_end_matches('/'),
            reference.repository,
            reference.tag
        )
    }

    async fn download(
        &self,
        reference: &ImageReference,
        progress: &ProgressReporter,
    ) -> std::result::Result<FetchedImage, Attempt> {
        let url = self.archive_url(reference);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Attempt::Retry(KeelError::backend(format!("request to {} failed: {}", url, e))))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Attempt::Fatal(KeelError::image_not_found(reference.to_string())));
        }
        if status.is_server_error() {
            return Err(Attempt::Retry(KeelError::backend(format!("mirror returned {}", status))));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(KeelError::backend(format!("mirror returned {}", status))));
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut writer = self.blobs.writer().await?;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Attempt::Retry(KeelError::backend(format!("download interrupted: {}", e))))?;
            writer.write(&chunk).await?;
            if let Some(total) = total {
                let percent = (writer.size().min(total) * 90 / total) as u8;
                progress.report(percent, None);
            }
        }

        progress.report(90, Some("verifying archive".to_string()));
        let (digest, size) = writer.commit().await?;

        let manifest = match self.blobs.read_manifest(&digest).await {
            Ok(manifest) => manifest.unwrap_or_default(),
            Err(e) => {
                let _ = self.blobs.delete(&digest).await;
                return Err(Attempt::Fatal(KeelError::backend(format!(
                    "archive for {} is corrupt: {}",
                    reference, e
                ))));
            }
        };

        Ok(FetchedImage {
            id: digest,
            size,
            created_at: chrono::Utc::now(),
            command: manifest.cmd,
            env: manifest.env,
        })
    }
}

#[async_trait]
impl ImageSource for MirrorSource {
    fn name(&self) -> &'static str {
        "mirror"
    }

    async fn fetch(&self, reference: &ImageReference, progress: &ProgressReporter) -> Result<FetchedImage> {
        let mut attempt = 1;
        loop {
            match self.download(reference, progress).await {
                Ok(image) => return Ok(image),
                Err(Attempt::Retry(e)) if attempt < self.retries => {
                    warn!("Pull of {} failed (attempt {}/{}): {}", reference, attempt, self.retries, e);
                    progress.line(&format!("retrying after: {}", e));
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(Attempt::Retry(e)) | Err(Attempt::Fatal(e)) => return Err(e),
            }
        }
    }
}

/// Used by the process backend when no mirror is configured
pub struct NoMirrorSource;

#[async_trait]
impl ImageSource for NoMirrorSource {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn fetch(&self, reference: &ImageReference, _progress: &ProgressReporter) -> Result<FetchedImage> {
        Err(KeelError::backend(format!(
            "cannot pull {}: no image mirror configured (set images.mirror)",
            reference
        )))
    }
}

// =============================================================================
// Docker CLI
// =============================================================================

/// Pulls through `docker pull` and reads metadata with `docker image inspect`
pub struct DockerCliSource {
    supervisor: Arc<Supervisor>,
    binary: String,
}

impl DockerCliSource {
    pub fn new(supervisor: Arc<Supervisor>, binary: impl Into<String>) -> Self {
        Self {
            supervisor,
            binary: binary.into(),
        }
    }
}

/// Read id, size and creation time of a local docker image
pub(crate) async fn docker_inspect(
    supervisor: &Arc<Supervisor>,
    binary: &str,
    reference: &ImageReference,
) -> Result<FetchedImage> {
    let task = TaskSpec::new(binary).args([
        "image".to_string(),
        "inspect".to_string(),
        "--format".to_string(),
        "{{.Id}}|{{.Size}}|{{.Created}}".to_string(),
        reference.to_string(),
    ]);
    let output = supervisor.run_task(&task, |_| {}).await?;
    if !output.success() {
        return Err(KeelError::image_not_found(reference.to_string()));
    }

    let line = output.stdout.lines().next().unwrap_or_default();
    let mut parts = line.split('|');
    let id = parts
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| KeelError::backend(format!("unexpected inspect output: {}", line)))?;
    let size = parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
    let created_at = parts
        .next()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);

    Ok(FetchedImage {
        id: id.to_string(),
        size,
        created_at,
        command: Vec::new(),
        env: Default::default(),
    })
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["not found", "manifest unknown", "pull access denied", "repository does not exist"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl ImageSource for DockerCliSource {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn fetch(&self, reference: &ImageReference, progress: &ProgressReporter) -> Result<FetchedImage> {
        let task = TaskSpec::new(&self.binary).args(["pull".to_string(), reference.to_string()]);

        let mut layers = 0u32;
        let mut done = 0u32;
        let output = self
            .supervisor
            .run_task(&task, |line| {
                if line.contains("Pulling fs layer") {
                    layers += 1;
                } else if line.contains("Pull complete") || line.contains("Already exists") {
                    done += 1;
                }
                let percent = if layers == 0 { 0 } else { (done.min(layers) * 90 / layers) as u8 };
                progress.report(percent, Some(line.to_string()));
            })
            .await?;

        if !output.success() {
            return Err(if is_missing_image(&output.stderr_tail) {
                KeelError::image_not_found(reference.to_string())
            } else {
                KeelError::backend(format!("docker pull {} failed: {}", reference, output.stderr_tail))
            });
        }

        docker_inspect(&self.supervisor, &self.binary, reference).await
    }

    async fn remove(&self, image: &Image) -> Result<()> {
        let task = TaskSpec::new(&self.binary).args(["rmi".to_string(), image.key()]);
        let output = self.supervisor.run_task(&task, |_| {}).await?;
        if output.success() || is_missing_image(&output.stderr_tail) {
            Ok(())
        } else {
            Err(KeelError::backend(format!("docker rmi failed: {}", output.stderr_tail)))
        }
    }
}
