#![allow(dead_code)]

use async_trait::async_trait;
use keel::KeelError;
use keel::config::KeelConfig;
use keel::images::{FetchedImage, ImageSource, ProgressReporter};
use keel::registry::ImageReference;
use keel::types::{ContainerInfo, RunRequest};
use keel::{KeelRuntime, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Image source serving any reference without touching the network
pub struct FakeSource {
    pub fetches: AtomicUsize,
    pub delay: Duration,
    pub missing: HashSet<String>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            delay,
            missing: HashSet::new(),
        }
    }

    pub fn missing(mut self, reference: &str) -> Self {
        self.missing.insert(reference.to_string());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

pub fn fake_digest(seed: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(seed.as_bytes())))
}

#[async_trait]
impl ImageSource for FakeSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch(&self, reference: &ImageReference, progress: &ProgressReporter) -> Result<FetchedImage> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&reference.to_string()) {
            return Err(KeelError::image_not_found(reference.to_string()));
        }

        for step in 1..=4u8 {
            tokio::time::sleep(self.delay / 4).await;
            progress.report(step * 20, Some(format!("layer {}/4", step)));
        }

        Ok(FetchedImage {
            id: fake_digest(&format!("{}#{}", reference, fetch)),
            size: 1024,
            created_at: chrono::Utc::now(),
            command: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            env: Default::default(),
        })
    }
}

pub fn test_config(dir: &TempDir) -> KeelConfig {
    let mut config = KeelConfig::default();
    config.engine.data_dir = dir.path().join("data");
    config.engine.stop_grace_period_secs = 2;
    config.engine.kill_timeout_secs = 2;
    config.engine.max_restarts = 2;
    config.engine.log_buffer_lines = 100;
    config
}

pub struct TestEngine {
    pub runtime: KeelRuntime,
    pub source: Arc<FakeSource>,
    pub dir: TempDir,
}

pub async fn engine_with(source: FakeSource) -> TestEngine {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(source);
    let runtime = KeelRuntime::with_image_source(test_config(&dir), source.clone())
        .await
        .unwrap();
    TestEngine {
        runtime,
        source,
        dir,
    }
}

/// Engine with `alpine:latest` already pulled
pub async fn engine() -> TestEngine {
    let engine = engine_with(FakeSource::new()).await;
    engine.runtime.pull_image("alpine", None).await.unwrap();
    engine
}

pub fn run_request(command: &str) -> RunRequest {
    RunRequest {
        image: "alpine:latest".to_string(),
        command: Some(command.to_string()),
        ..Default::default()
    }
}

/// Poll `inspect` until `check` holds or five seconds pass
pub async fn wait_until<F>(runtime: &KeelRuntime, id: &str, mut check: F) -> ContainerInfo
where
    F: FnMut(&ContainerInfo) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = runtime.inspect_container(id).unwrap();
        if check(&info) {
            return info;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on container {}: {:?}",
            id,
            info
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
