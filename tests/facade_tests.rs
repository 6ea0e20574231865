mod common;

use common::{FakeSource, engine, run_request, test_config};
use keel::registry::ContainerStatus;
use keel::types::{ApiError, ContainerInfo, ImageInfo, SystemStats};
use keel::{ErrorKind, KeelConfig, KeelRuntime, normalize_status, server};
use std::sync::Arc;
use test_case::test_case;

#[test_case("Up 2 hours" => Some(ContainerStatus::Running); "docker up")]
#[test_case("running" => Some(ContainerStatus::Running); "plain running")]
#[test_case("Restarting (1) 5 seconds ago" => Some(ContainerStatus::Running); "restarting")]
#[test_case("Exited (0) 3 minutes ago" => Some(ContainerStatus::Exited); "exited")]
#[test_case("Dead" => Some(ContainerStatus::Exited); "dead")]
#[test_case("Paused" => Some(ContainerStatus::Paused); "paused")]
#[test_case("Up 5 minutes (Paused)" => Some(ContainerStatus::Paused); "up but paused")]
#[test_case("created" => Some(ContainerStatus::Created); "created")]
#[test_case("  Stopped (143) 1 second ago " => Some(ContainerStatus::Stopped); "stopped padded")]
#[test_case("Removal In Progress" => Some(ContainerStatus::Removing); "removal")]
#[test_case("bogus" => None; "unknown word")]
#[test_case("" => None; "empty")]
#[test_case("upper" => None; "prefix of a word")]
fn test_normalize_status(raw: &str) -> Option<ContainerStatus> {
    normalize_status(raw)
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_defaults_validate() {
    let config = KeelConfig::default();
    config.validate().unwrap();
    assert_eq!(config.server.listen, "127.0.0.1:2377");
    assert!(config.images.mirror.is_none());
}

#[test]
fn test_config_parse_partial_file() {
    let config = KeelConfig::parse(
        r#"
[engine]
max_restarts = 9
stop_grace_period_secs = 3

[images]
mirror = "https://mirror.example.com/images"

[logging]
level = "debug"
json = true
"#,
    )
    .unwrap();

    assert_eq!(config.engine.max_restarts, 9);
    assert_eq!(config.engine.stop_grace_period_secs, 3);
    assert_eq!(config.engine.kill_timeout_secs, 5);
    assert_eq!(
        config.images.mirror.as_deref(),
        Some("https://mirror.example.com/images")
    );
    let tracing = config.tracing();
    assert_eq!(tracing.log_level, "debug");
    assert!(tracing.json);
}

#[test]
fn test_config_rejects_bad_values() {
    assert!(KeelConfig::parse("[images]\nmirror = \"ftp://nope\"\n").is_err());
    assert!(KeelConfig::parse("[engine]\nlog_buffer_lines = 0\n").is_err());
    assert!(KeelConfig::parse("[server]\nlisten = \"not an address\"\n").is_err());
    assert!(KeelConfig::parse("engine = 3").is_err());
}

#[test]
fn test_config_load_and_save() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    assert!(KeelConfig::load(Some(&path)).is_err());

    let mut config = test_config(&dir);
    config.engine.max_restarts = 4;
    config.save(&path).unwrap();

    let loaded = KeelConfig::load(Some(&path)).unwrap();
    assert_eq!(loaded, config);
}

// =============================================================================
// Facade
// =============================================================================

#[tokio::test]
async fn test_run_request_validation() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let cases = [
        ("ports", {
            let mut r = run_request("sleep 1");
            r.ports = vec!["eighty:80".to_string()];
            r
        }),
        ("env", {
            let mut r = run_request("sleep 1");
            r.env = vec!["NOVALUE".to_string()];
            r
        }),
        ("restart", {
            let mut r = run_request("sleep 1");
            r.restart = Some("sometimes".to_string());
            r
        }),
        ("memory", {
            let mut r = run_request("sleep 1");
            r.memory = Some("lots".to_string());
            r
        }),
    ];

    for (field, request) in cases {
        let err = rt.run_container(request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BackendFailure, "{}", field);
    }
    assert!(rt.list_containers(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_exec_requires_a_command() {
    let engine = engine().await;
    let rt = &engine.runtime;
    let container = rt.run_container(run_request("sleep 30")).await.unwrap();

    let err = rt.exec_into_container(&container.id, "  ").await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::BackendFailure);

    rt.shutdown().await;
}

#[tokio::test]
async fn test_runtime_without_mirror_cannot_pull() {
    let dir = tempfile::TempDir::new().unwrap();
    let rt = KeelRuntime::new(test_config(&dir)).await.unwrap();

    let err = rt.pull_image("alpine", None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendFailure);
    assert!(err.message.contains("images.mirror"), "{}", err.message);
}

#[tokio::test]
async fn test_changes_are_published() {
    let engine = engine().await;
    let rt = &engine.runtime;
    let mut changes = rt.subscribe_changes();

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    rt.stop_container(&container.id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = changes.try_recv() {
        seen.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
    }
    assert_eq!(seen.first().map(String::as_str), Some("container_created"));
    assert!(seen.iter().any(|t| t == "container_status_changed"));
}

// =============================================================================
// HTTP API
// =============================================================================

async fn api() -> (tempfile::TempDir, Arc<KeelRuntime>) {
    let dir = tempfile::TempDir::new().unwrap();
    let runtime = Arc::new(
        KeelRuntime::with_image_source(test_config(&dir), Arc::new(FakeSource::new()))
            .await
            .unwrap(),
    );
    (dir, runtime)
}

#[tokio::test]
async fn test_api_stats() {
    let (_dir, runtime) = api().await;
    let routes = server::routes(Arc::clone(&runtime));

    let res = warp::test::request().method("GET").path("/stats").reply(&routes).await;
    assert_eq!(res.status(), 200);
    let stats: SystemStats = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(stats.total_containers, 0);
    assert_eq!(stats.backend, "process");
}

#[tokio::test]
async fn test_api_unknown_container_is_404() {
    let (_dir, runtime) = api().await;
    let routes = server::routes(runtime);

    let res = warp::test::request()
        .method("GET")
        .path("/containers/nope")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 404);
    let body: ApiError = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_api_bad_body_is_400() {
    let (_dir, runtime) = api().await;
    let routes = server::routes(runtime);

    let res = warp::test::request()
        .method("POST")
        .path("/containers")
        .header("content-type", "application/json")
        .body("{not json")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn test_api_pull_run_and_remove() {
    let (_dir, runtime) = api().await;
    let routes = server::routes(Arc::clone(&runtime));

    let res = warp::test::request()
        .method("POST")
        .path("/images/pull")
        .json(&serde_json::json!({ "repository": "alpine" }))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    let image: ImageInfo = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(image.tag, "latest");

    let res = warp::test::request()
        .method("POST")
        .path("/containers")
        .json(&serde_json::json!({ "image": "alpine", "name": "api-web", "command": "sleep 30" }))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 201);
    let container: ContainerInfo = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(container.name, "api-web");
    assert_eq!(container.status, ContainerStatus::Running);

    let res = warp::test::request()
        .method("GET")
        .path("/containers?status=Up%202%20minutes")
        .reply(&routes)
        .await;
    let listed: Vec<ContainerInfo> = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(listed.len(), 1);

    // still running, so removal is refused
    let res = warp::test::request()
        .method("DELETE")
        .path(&format!("/containers/{}", container.id))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 409);

    let res = warp::test::request()
        .method("POST")
        .path(&format!("/containers/{}/stop", container.id))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);

    let res = warp::test::request()
        .method("DELETE")
        .path(&format!("/containers/{}", container.id))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 204);

    let res = warp::test::request()
        .method("DELETE")
        .path("/images?reference=alpine")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    assert!(runtime.list_images().is_empty());
}

#[tokio::test]
async fn test_api_unknown_action() {
    let (_dir, runtime) = api().await;
    let routes = server::routes(runtime);

    let res = warp::test::request()
        .method("POST")
        .path("/containers/abc/explode")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 404);
}
