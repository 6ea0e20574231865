//! HTTP/JSON transport for [`KeelRuntime`].
//!
//! Unary calls answer with JSON. Logs and exec output stream as
//! newline-delimited JSON; change and progress events are served as
//! server-sent events on `/events`.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use warp::http::StatusCode;
use warp::http::header::{CONTENT_TYPE, HeaderValue};
use warp::{Filter, Rejection, Reply};

use crate::error::{ErrorKind, KeelError, Result};
use crate::types::{ApiError, BuildRequest, ExecChunk, ExecRequest, PullRequest, RunRequest};
use crate::KeelRuntime;

impl warp::reject::Reject for ApiError {}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ImageQuery {
    pub reference: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CancelBuildRequest {
    pub tag: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Cancelled {
    pub cancelled: bool,
}

/// HTTP server exposing the engine
pub struct ApiServer {
    runtime: Arc<KeelRuntime>,
    listen: SocketAddr,
}

impl ApiServer {
    pub fn new(runtime: Arc<KeelRuntime>, listen: SocketAddr) -> Self {
        Self { runtime, listen }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let routes = routes(Arc::clone(&self.runtime));
        let (addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(self.listen, shutdown)
            .map_err(|e| KeelError::backend(format!("cannot listen on {}: {}", self.listen, e)))?;

        info!("✅ Keel API listening on http://{}", addr);
        server.await;
        info!("API server stopped");
        Ok(())
    }
}

fn with_runtime(
    runtime: Arc<KeelRuntime>,
) -> impl Filter<Extract = (Arc<KeelRuntime>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&runtime))
}

/// All routes, with error recovery applied
pub fn routes(
    runtime: Arc<KeelRuntime>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let rt = || with_runtime(Arc::clone(&runtime));

    // Container endpoints
    let containers_list = warp::path!("containers")
        .and(warp::get())
        .and(warp::query::<ListQuery>())
        .and(rt())
        .and_then(list_containers);

    let containers_run = warp::path!("containers")
        .and(warp::post())
        .and(warp::body::json::<RunRequest>())
        .and(rt())
        .and_then(run_container);

    let containers_inspect = warp::path!("containers" / String)
        .and(warp::get())
        .and(rt())
        .and_then(inspect_container);

    let containers_action = warp::path!("containers" / String / String)
        .and(warp::post())
        .and(rt())
        .and_then(container_action);

    let containers_remove = warp::path!("containers" / String)
        .and(warp::delete())
        .and(rt())
        .and_then(remove_container);

    let containers_logs = warp::path!("containers" / String / "logs")
        .and(warp::get())
        .and(warp::query::<LogsQuery>())
        .and(rt())
        .and_then(stream_logs);

    let containers_exec = warp::path!("containers" / String / "exec")
        .and(warp::post())
        .and(warp::body::json::<ExecRequest>())
        .and(rt())
        .and_then(exec_into_container);

    // Image endpoints
    let images_list = warp::path!("images")
        .and(warp::get())
        .and(rt())
        .and_then(list_images);

    let images_pull = warp::path!("images" / "pull")
        .and(warp::post())
        .and(warp::body::json::<PullRequest>())
        .and(rt())
        .and_then(pull_image);

    let images_pull_cancel = warp::path!("images" / "pull" / "cancel")
        .and(warp::post())
        .and(warp::body::json::<PullRequest>())
        .and(rt())
        .and_then(cancel_pull);

    let images_build = warp::path!("images" / "build")
        .and(warp::post())
        .and(warp::body::json::<BuildRequest>())
        .and(rt())
        .and_then(build_image);

    let images_build_cancel = warp::path!("images" / "build" / "cancel")
        .and(warp::post())
        .and(warp::body::json::<CancelBuildRequest>())
        .and(rt())
        .and_then(cancel_build);

    let images_remove = warp::path!("images")
        .and(warp::delete())
        .and(warp::query::<ImageQuery>())
        .and(rt())
        .and_then(remove_image);

    // System endpoints
    let stats = warp::path!("stats")
        .and(warp::get())
        .and(rt())
        .and_then(stats);

    let events = warp::path!("events")
        .and(warp::get())
        .and(rt())
        .map(events);

    containers_list
        .or(containers_run)
        .or(containers_logs)
        .or(containers_exec)
        .or(containers_action)
        .or(containers_inspect)
        .or(containers_remove)
        .or(images_pull_cancel)
        .or(images_build_cancel)
        .or(images_pull)
        .or(images_build)
        .or(images_list)
        .or(images_remove)
        .or(stats)
        .or(events)
        .with(warp::cors().allow_any_origin())
        .recover(handle_rejection)
        .with(warp::log("keel::api"))
}

// =============================================================================
// Handlers
// =============================================================================

fn reject(err: ApiError) -> Rejection {
    warp::reject::custom(err)
}

async fn list_containers(
    query: ListQuery,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let containers = runtime.list_containers(query.status.as_deref()).map_err(reject)?;
    Ok(warp::reply::json(&containers))
}

async fn run_container(
    request: RunRequest,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let container = runtime.run_container(request).await.map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&container),
        StatusCode::CREATED,
    ))
}

async fn inspect_container(
    id: String,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let container = runtime.inspect_container(&id).map_err(reject)?;
    Ok(warp::reply::json(&container))
}

async fn container_action(
    id: String,
    action: String,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let container = match action.as_str() {
        "start" => runtime.start_container(&id).await,
        "stop" => runtime.stop_container(&id).await,
        "pause" => runtime.pause_container(&id).await,
        "unpause" => runtime.unpause_container(&id).await,
        _ => return Err(warp::reject::not_found()),
    }
    .map_err(reject)?;
    Ok(warp::reply::json(&container))
}

async fn remove_container(
    id: String,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    runtime.remove_container(&id).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_logs(
    id: String,
    query: LogsQuery,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    if !query.follow {
        let lines = runtime.recent_logs(&id).map_err(reject)?;
        return Ok(ndjson(futures::stream::iter(lines)));
    }
    let feed = runtime.stream_logs(&id).map_err(reject)?;
    debug!(container_id = %id, "log stream attached");
    Ok(ndjson(feed))
}

async fn exec_into_container(
    id: String,
    request: ExecRequest,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let stream = runtime
        .exec_into_container(&id, &request.command)
        .await
        .map_err(reject)?;
    Ok(ndjson(stream.map(ExecChunk::from)))
}

async fn list_images(runtime: Arc<KeelRuntime>) -> std::result::Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&runtime.list_images()))
}

async fn pull_image(
    request: PullRequest,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let image = runtime
        .pull_image(&request.repository, request.tag.as_deref())
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&image))
}

async fn cancel_pull(
    request: PullRequest,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let cancelled = runtime
        .cancel_pull(&request.repository, request.tag.as_deref())
        .map_err(reject)?;
    Ok(warp::reply::json(&Cancelled { cancelled }))
}

async fn build_image(
    request: BuildRequest,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let image = runtime
        .build_image(&request.path, &request.tag)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&image))
}

async fn cancel_build(
    request: CancelBuildRequest,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let cancelled = runtime.cancel_build(&request.tag).map_err(reject)?;
    Ok(warp::reply::json(&Cancelled { cancelled }))
}

async fn remove_image(
    query: ImageQuery,
    runtime: Arc<KeelRuntime>,
) -> std::result::Result<impl Reply, Rejection> {
    let removed = runtime.remove_image(&query.reference).await.map_err(reject)?;
    Ok(warp::reply::json(&removed))
}

async fn stats(runtime: Arc<KeelRuntime>) -> std::result::Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&runtime.stats()))
}

fn events(runtime: Arc<KeelRuntime>) -> impl Reply {
    let changes = broadcast_stream(runtime.subscribe_changes())
        .map(|event| warp::sse::Event::default().event("change").json_data(&event));
    let progress = broadcast_stream(runtime.subscribe_progress())
        .map(|event| warp::sse::Event::default().event("progress").json_data(&event));

    warp::sse::reply(warp::sse::keep_alive().stream(futures::stream::select(changes, progress)))
}

// =============================================================================
// Streaming helpers
// =============================================================================

/// Items of a broadcast channel until it closes; lagged items are skipped
pub fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> impl Stream<Item = T> + Send + 'static
where
    T: Clone + Send + 'static,
{
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Newline-delimited JSON response body
fn ndjson<S, T>(items: S) -> warp::http::Response<warp::hyper::Body>
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let lines = items.filter_map(|item| async move {
        match serde_json::to_string(&item) {
            Ok(mut line) => {
                line.push('\n');
                Some(Ok::<_, Infallible>(line))
            }
            Err(e) => {
                error!("Failed to encode stream item: {}", e);
                None
            }
        }
    });

    let mut response = warp::http::Response::new(warp::hyper::Body::wrap_stream(lines));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
    response
}

// =============================================================================
// Error mapping
// =============================================================================

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState | ErrorKind::ResourceInUse | ErrorKind::Conflict => {
            StatusCode::CONFLICT
        }
        ErrorKind::Cancelled => StatusCode::GONE,
        ErrorKind::BackendFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (status, body) = if let Some(api) = err.find::<ApiError>() {
        (status_for(api.kind), api.clone())
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            ApiError::new(ErrorKind::NotFound, "no such endpoint"),
        )
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            ApiError::new(ErrorKind::BackendFailure, format!("invalid request body: {}", e)),
        )
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (
            StatusCode::BAD_REQUEST,
            ApiError::new(ErrorKind::BackendFailure, e.to_string()),
        )
    } else if let Some(e) = err.find::<warp::filters::cors::CorsForbidden>() {
        (
            StatusCode::FORBIDDEN,
            ApiError::new(ErrorKind::BackendFailure, e.to_string()),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ApiError::new(ErrorKind::BackendFailure, "method not allowed"),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::new(ErrorKind::BackendFailure, "internal error"),
        )
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
