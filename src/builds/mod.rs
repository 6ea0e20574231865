//! Image builders.
//!
//! The local builder stages a copy of the build context, runs the optional
//! `script` from its `Keelfile.toml` there, and packs the result into the
//! blob store. The docker builder delegates to `docker build`.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::error::{KeelError, Result};
use crate::images::sources::docker_inspect;
use crate::images::{FetchedImage, ProgressReporter};
use crate::registry::ImageReference;
use crate::runtime::storage::{ImageManifest, MANIFEST_FILE};
use crate::runtime::{BlobStore, Supervisor, TaskSpec};

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(
        &self,
        context: &Path,
        reference: &ImageReference,
        progress: &ProgressReporter,
    ) -> Result<FetchedImage>;

    /// Best-effort cleanup after a failed or cancelled build
    async fn discard(&self, _reference: &ImageReference) {}
}

/// Read the build manifest of a context directory, if present
pub async fn read_context_manifest(context: &Path) -> Result<ImageManifest> {
    match tokio::fs::read_to_string(context.join(MANIFEST_FILE)).await {
        Ok(text) => ImageManifest::parse(&text).map_err(|e| {
            KeelError::backend(format!("invalid {}: {}", MANIFEST_FILE, e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageManifest::default()),
        Err(e) => Err(e.into()),
    }
}

/// Scratch directory removed when dropped
struct StagingDir {
    path: PathBuf,
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove build staging dir {}: {}", self.path.display(), e);
            }
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(KeelError::backend)?;
        let rel = entry.path().strip_prefix(from).map_err(KeelError::backend)?;
        let target = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        }
    }
    Ok(copied)
}

/// Builds images on the host from a context directory
pub struct LocalBuilder {
    supervisor: Arc<Supervisor>,
    blobs: Arc<BlobStore>,
    work_dir: PathBuf,
}

impl LocalBuilder {
    pub fn new(supervisor: Arc<Supervisor>, blobs: Arc<BlobStore>, work_dir: PathBuf) -> Self {
        Self {
            supervisor,
            blobs,
            work_dir,
        }
    }

    async fn stage(&self, context: &Path) -> Result<StagingDir> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let staging = StagingDir {
            path: self
                .work_dir
                .join(format!("build-{}", uuid::Uuid::new_v4().simple())),
        };
        let (from, to) = (context.to_path_buf(), staging.path.clone());
        let files = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(KeelError::backend)??;
        debug!("staged {} files from {}", files, context.display());
        Ok(staging)
    }
}

#[async_trait]
impl ImageBuilder for LocalBuilder {
    async fn build(
        &self,
        context: &Path,
        reference: &ImageReference,
        progress: &ProgressReporter,
    ) -> Result<FetchedImage> {
        info!("🔨 Building {} from {}", reference, context.display());
        let manifest = read_context_manifest(context).await?;
        progress.report(5, Some(format!("reading context {}", context.display())));

        let staging = self.stage(context).await?;
        progress.report(10, Some("context staged".to_string()));

        if let Some(ref script) = manifest.script {
            let mut task = TaskSpec::new("sh")
                .args(["-c".to_string(), script.clone()])
                .cwd(&staging.path)
                .env("PATH", std::env::var("PATH").unwrap_or_default());
            for (key, value) in &manifest.env {
                task = task.env(key, value);
            }

            let mut lines = 0u32;
            let output = self
                .supervisor
                .run_task(&task, |line| {
                    lines += 1;
                    progress.report(10 + lines.min(70) as u8, Some(line.to_string()));
                })
                .await?;

            if !output.success() {
                return Err(KeelError::backend(format!(
                    "build script failed with exit code {}: {}",
                    output.code, output.stderr_tail
                )));
            }
        }

        progress.report(85, Some("packing image".to_string()));
        let (digest, size) = self.blobs.pack_dir(&staging.path).await?;
        drop(staging);

        Ok(FetchedImage {
            id: digest,
            size,
            created_at: chrono::Utc::now(),
            command: manifest.cmd,
            env: manifest.env,
        })
    }
}

/// Builds through `docker build`
pub struct DockerCliBuilder {
    supervisor: Arc<Supervisor>,
    binary: String,
}

impl DockerCliBuilder {
    pub fn new(supervisor: Arc<Supervisor>, binary: impl Into<String>) -> Self {
        Self {
            supervisor,
            binary: binary.into(),
        }
    }
}

/// Step counter of classic (`Step 3/7`) and BuildKit (`[3/7]`) output
fn build_step(line: &str) -> Option<(u32, u32)> {
    static STEP: OnceLock<Option<Regex>> = OnceLock::new();
    let re = STEP
        .get_or_init(|| Regex::new(r"(?:Step |\[)(\d+)/(\d+)").ok())
        .as_ref()?;
    let caps = re.captures(line)?;
    let current = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    (total > 0).then_some((current, total))
}

#[async_trait]
impl ImageBuilder for DockerCliBuilder {
    async fn build(
        &self,
        context: &Path,
        reference: &ImageReference,
        progress: &ProgressReporter,
    ) -> Result<FetchedImage> {
        info!("🔨 docker build -t {} {}", reference, context.display());
        let task = TaskSpec::new(&self.binary)
            .args(["build".to_string(), "-t".to_string(), reference.to_string()])
            .arg(context.display().to_string());

        let output = self
            .supervisor
            .run_task(&task, |line| {
                let percent = build_step(line)
                    .map(|(current, total)| (current.min(total) * 90 / total) as u8)
                    .unwrap_or(0);
                progress.report(percent, Some(line.to_string()));
            })
            .await?;

        if !output.success() {
            return Err(KeelError::backend(format!(
                "docker build failed with exit code {}: {}",
                output.code, output.stderr_tail
            )));
        }

        docker_inspect(&self.supervisor, &self.binary, reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_step_parsing() {
        assert_eq!(build_step("Step 3/7 : RUN make"), Some((3, 7)));
        assert_eq!(build_step("#6 [2/4] COPY . /app"), Some((2, 4)));
        assert_eq!(build_step("Successfully built abc"), None);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_default() {
        let temp = tempfile::TempDir::new().unwrap();
        let manifest = read_context_manifest(temp.path()).await.unwrap();
        assert_eq!(manifest, ImageManifest::default());
    }

    #[tokio::test]
    async fn test_manifest_parsing() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(MANIFEST_FILE),
            "script = \"echo building\"\ncmd = [\"sh\", \"-c\", \"echo hi\"]\n\n[env]\nMODE = \"prod\"\n",
        )
        .unwrap();

        let manifest = read_context_manifest(temp.path()).await.unwrap();
        assert_eq!(manifest.script.as_deref(), Some("echo building"));
        assert_eq!(manifest.cmd.len(), 3);
        assert_eq!(manifest.env.get("MODE").map(String::as_str), Some("prod"));
    }
}
