//! Content-addressed blob store for image archives.
//!
//! Blobs live at `<root>/blobs/sha256/<hex>` and are always gzip-compressed
//! tarballs. Writes go to `<root>/tmp` first and are only moved into place
//! once the digest is known, so a reader never sees a partial blob.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{KeelError, Result};

/// Name of the build manifest at the root of a build context and archive
pub const MANIFEST_FILE: &str = "Keelfile.toml";

/// Build manifest carried inside an image archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Shell script run in the context directory before packing
    #[serde(default)]
    pub script: Option<String>,
    /// Default command for containers of this image
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        for dir in ["blobs/sha256", "tmp"] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn hex_of(digest: &str) -> Option<&str> {
        let hex = digest.strip_prefix("sha256:")?;
        (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
    }

    /// Path of a committed blob; `None` for ids that are not sha256 digests
    pub fn path_for(&self, digest: &str) -> Option<PathBuf> {
        Self::hex_of(digest).map(|hex| self.root.join("blobs/sha256").join(hex))
    }

    pub async fn contains(&self, digest: &str) -> bool {
        match self.path_for(digest) {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }

    /// Open a writer for a new blob
    pub async fn writer(&self) -> Result<BlobWriter> {
        let path = self
            .root
            .join("tmp")
            .join(format!("{}.partial", uuid::Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&path).await?;
        Ok(BlobWriter {
            file: Some(file),
            path,
            hasher: Sha256::new(),
            size: 0,
            blobs_dir: self.root.join("blobs/sha256"),
        })
    }

    pub async fn delete(&self, digest: &str) -> Result<()> {
        let Some(path) = self.path_for(digest) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("🗑️  Deleted blob {}", digest);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove leftovers of interrupted writes
    pub async fn clear_tmp(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(self.root.join("tmp")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("🧹 Removed {} partial blobs", removed);
        }
        Ok(removed)
    }

    /// Extract a blob into `dest`
    pub async fn unpack(&self, digest: &str, dest: &Path) -> Result<()> {
        let path = self
            .path_for(digest)
            .ok_or_else(|| KeelError::image_not_found(digest))?;
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&path)?;
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
            archive.set_preserve_permissions(true);
            archive.unpack(&dest)?;
            Ok(())
        })
        .await
        .map_err(KeelError::backend)?
    }

    /// Read the build manifest stored in an archive, if it has one
    pub async fn read_manifest(&self, digest: &str) -> Result<Option<ImageManifest>> {
        let path = self
            .path_for(digest)
            .ok_or_else(|| KeelError::image_not_found(digest))?;

        let text = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let file = std::fs::File::open(&path)?;
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
            for entry in archive.entries()? {
                let mut entry = entry?;
                let name = entry.path()?.to_path_buf();
                if name == Path::new(MANIFEST_FILE) || name == Path::new("./").join(MANIFEST_FILE) {
                    let mut text = String::new();
                    entry.read_to_string(&mut text)?;
                    return Ok(Some(text));
                }
            }
            Ok(None)
        })
        .await
        .map_err(KeelError::backend)??;

        text.map(|t| ImageManifest::parse(&t)).transpose()
    }

    /// Pack a directory tree into a new blob
    pub async fn pack_dir(&self, dir: &Path) -> Result<(String, u64)> {
        let dir = dir.to_path_buf();
        let tmp = self
            .root
            .join("tmp")
            .join(format!("{}.partial", uuid::Uuid::new_v4().simple()));
        let tmp_path = tmp.clone();

        let packed = tokio::task::spawn_blocking(move || -> Result<(String, u64)> {
            let file = std::fs::File::create(&tmp_path)?;
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);

            for entry in walkdir::WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry.map_err(KeelError::backend)?;
                let rel = entry
                    .path()
                    .strip_prefix(&dir)
                    .map_err(KeelError::backend)?;
                if rel.as_os_str().is_empty() {
                    continue;
                }
                builder.append_path_with_name(entry.path(), rel)?;
            }
            builder.into_inner()?.finish()?;

            let mut hasher = Sha256::new();
            let mut file = std::fs::File::open(&tmp_path)?;
            let size = std::io::copy(&mut file, &mut hasher)?;
            Ok((hex::encode(hasher.finalize()), size))
        })
        .await
        .map_err(KeelError::backend)?;

        let (hex, size) = match packed {
            Ok(done) => done,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&tmp, self.root.join("blobs/sha256").join(&hex)).await?;
        Ok((format!("sha256:{}", hex), size))
    }
}

/// Streams a blob to disk while hashing it. Dropping an uncommitted writer
/// removes the partial file.
pub struct BlobWriter {
    file: Option<tokio::fs::File>,
    path: PathBuf,
    hasher: Sha256,
    size: u64,
    blobs_dir: PathBuf,
}

impl BlobWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| KeelError::backend("blob writer already finished"))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Move the blob into place; returns its digest and size
    pub async fn commit(mut self) -> Result<(String, u64)> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| KeelError::backend("blob writer already finished"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let hex = hex::encode(self.hasher.clone().finalize());
        tokio::fs::rename(&self.path, self.blobs_dir.join(&hex)).await?;
        // the file now lives under its digest; nothing left for Drop
        self.path = PathBuf::new();
        Ok((format!("sha256:{}", hex), self.size))
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial blob {}: {}", self.path.display(), e);
            }
        }
    }
}
