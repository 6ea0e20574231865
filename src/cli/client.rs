//! HTTP client for the engine API used by the CLI subcommands.

use anyhow::{Context, Result};
use futures::StreamExt;
use keel::streams::LogEntry;
use keel::types::{
    ApiError, BuildRequest, ContainerInfo, ExecChunk, ExecRequest, ImageInfo, PullRequest,
    RunRequest, SystemStats,
};
use serde::de::DeserializeOwned;

pub struct KeelClient {
    http: reqwest::Client,
    base: String,
}

impl KeelClient {
    pub fn new(host: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: host.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Fail with the engine's error body on non-success
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiError>(&body) {
            Ok(api) => Err(api.into()),
            Err(_) => Err(anyhow::anyhow!("engine returned {}: {}", status, body)),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach the Keel engine at {}", self.base))?;
        Ok(self.check(response).await?.json().await?)
    }

    async fn stream(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach the Keel engine at {}", self.base))?;
        self.check(response).await
    }

    pub async fn list_containers(&self, status: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let mut request = self.http.get(self.url("/containers"));
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        self.send(request).await
    }

    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.send(self.http.get(self.url("/images"))).await
    }

    pub async fn run(&self, request: &RunRequest) -> Result<ContainerInfo> {
        self.send(self.http.post(self.url("/containers")).json(request)).await
    }

    /// `start`, `stop`, `pause` or `unpause`
    pub async fn container_action(&self, id: &str, action: &str) -> Result<ContainerInfo> {
        self.send(self.http.post(self.url(&format!("/containers/{}/{}", id, action))))
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.stream(self.http.delete(self.url(&format!("/containers/{}", id))))
            .await?;
        Ok(())
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        self.send(self.http.get(self.url(&format!("/containers/{}", id))))
            .await
    }

    pub async fn pull(&self, repository: &str, tag: &str) -> Result<ImageInfo> {
        let request = PullRequest {
            repository: repository.to_string(),
            tag: Some(tag.to_string()),
        };
        self.send(self.http.post(self.url("/images/pull")).json(&request))
            .await
    }

    pub async fn remove_image(&self, reference: &str) -> Result<Vec<ImageInfo>> {
        self.send(
            self.http
                .delete(self.url("/images"))
                .query(&[("reference", reference)]),
        )
        .await
    }

    pub async fn build(&self, path: &str, tag: &str) -> Result<ImageInfo> {
        let context = std::fs::canonicalize(path)
            .with_context(|| format!("build context {} not found", path))?;
        let request = BuildRequest {
            path: context.display().to_string(),
            tag: tag.to_string(),
        };
        self.send(self.http.post(self.url("/images/build")).json(&request))
            .await
    }

    pub async fn stats(&self) -> Result<SystemStats> {
        self.send(self.http.get(self.url("/stats"))).await
    }

    /// Run a command and hand each output chunk to `on_chunk`; returns the
    /// exit code
    pub async fn exec<F>(&self, id: &str, command: &str, mut on_chunk: F) -> Result<i32>
    where
        F: FnMut(ExecChunk),
    {
        let request = ExecRequest {
            command: command.to_string(),
        };
        let response = self
            .stream(
                self.http
                    .post(self.url(&format!("/containers/{}/exec", id)))
                    .json(&request),
            )
            .await?;

        let mut exit_code = None;
        read_lines(response, |line| {
            let chunk: ExecChunk = serde_json::from_str(line)?;
            if let ExecChunk::Exit { code } = chunk {
                exit_code = Some(code);
            }
            on_chunk(chunk);
            Ok(())
        })
        .await?;

        exit_code.context("exec stream ended without an exit code")
    }

    pub async fn logs<F>(&self, id: &str, follow: bool, mut on_entry: F) -> Result<()>
    where
        F: FnMut(LogEntry),
    {
        let response = self
            .stream(
                self.http
                    .get(self.url(&format!("/containers/{}/logs", id)))
                    .query(&[("follow", follow)]),
            )
            .await?;
        read_lines(response, |line| {
            on_entry(serde_json::from_str(line)?);
            Ok(())
        })
        .await
    }

    /// Follow `/events`, handing `(event, data)` pairs to `on_event`
    pub async fn events<F>(&self, mut on_event: F) -> Result<()>
    where
        F: FnMut(&str, &str),
    {
        let response = self.stream(self.http.get(self.url("/events"))).await?;
        let mut event = String::from("message");
        read_lines(response, |line| {
            if let Some(name) = line.strip_prefix("event:") {
                event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                on_event(&event, data.trim());
                event = String::from("message");
            }
            Ok(())
        })
        .await
    }
}

/// Feed each non-empty line of a streamed body to `on_line`
async fn read_lines<F>(response: reqwest::Response, mut on_line: F) -> Result<()>
where
    F: FnMut(&str) -> Result<()>,
{
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end();
            if !line.is_empty() {
                on_line(line)?;
            }
        }
    }

    let rest = String::from_utf8_lossy(&buffer);
    if !rest.trim().is_empty() {
        on_line(rest.trim_end())?;
    }
    Ok(())
}
