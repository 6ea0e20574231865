mod common;

use common::{engine, run_request, wait_until};
use keel::ErrorKind;
use keel::registry::{ContainerStatus, RegistryEvent};
use keel::types::RunRequest;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_run_stop_remove() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    assert_eq!(container.status, ContainerStatus::Running);
    assert!(container.started_at.is_some());

    let stopped = rt.stop_container(&container.id).await.unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert!(stopped.finished_at.is_some());

    // a second stop is a no-op
    let again = rt.stop_container(&container.id).await.unwrap();
    assert_eq!(again.status, ContainerStatus::Stopped);

    rt.remove_container(&container.id).await.unwrap();
    let err = rt.inspect_container(&container.id).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert!(rt.list_containers(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_running_is_invalid_state() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    let err = rt.remove_container(&container.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert_eq!(
        rt.inspect_container(&container.id).unwrap().status,
        ContainerStatus::Running
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn test_run_with_unknown_image() {
    let engine = engine().await;
    let request = RunRequest {
        image: "nginx:1.25".to_string(),
        command: Some("true".to_string()),
        ..Default::default()
    };
    let err = engine.runtime.run_container(request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert!(engine.runtime.list_containers(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let mut request = run_request("sleep 30");
    request.name = Some("web".to_string());
    let first = rt.run_container(request.clone()).await.unwrap();
    assert_eq!(first.name, "web");

    let err = rt.run_container(request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
    assert_eq!(rt.list_containers(None).unwrap().len(), 1);

    rt.shutdown().await;
}

#[tokio::test]
async fn test_generated_names_are_unique() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let a = rt.run_container(run_request("true")).await.unwrap();
    let b = rt.run_container(run_request("true")).await.unwrap();
    assert!(a.name.starts_with("keel_"));
    assert_ne!(a.name, b.name);
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn test_natural_exit_records_code() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("exit 3")).await.unwrap();
    let exited = wait_until(rt, &container.id, |c| c.status == ContainerStatus::Exited).await;
    assert_eq!(exited.exit_code, Some(3));
    assert!(exited.status_text.starts_with("Exited (3)"));

    // stop on an exited container is a no-op
    let stopped = rt.stop_container(&container.id).await.unwrap();
    assert_eq!(stopped.status, ContainerStatus::Exited);

    // and it can be started again
    let restarted = rt.start_container(&container.id).await.unwrap();
    assert_eq!(restarted.status, ContainerStatus::Running);
    wait_until(rt, &container.id, |c| c.status == ContainerStatus::Exited).await;
}

#[tokio::test]
async fn test_on_failure_restart_is_capped() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let mut request = run_request("exit 1");
    request.restart = Some("on-failure".to_string());
    let container = rt.run_container(request).await.unwrap();

    // max_restarts is 2 in the test config
    let settled = wait_until(rt, &container.id, |c| {
        c.status == ContainerStatus::Exited && c.restart_count == 2
    })
    .await;
    assert_eq!(settled.exit_code, Some(1));

    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    let info = rt.inspect_container(&container.id).unwrap();
    assert_eq!(info.restart_count, 2);
    assert_eq!(info.status, ContainerStatus::Exited);
}

#[tokio::test]
async fn test_restart_policy_ignores_clean_exit_on_failure() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let mut request = run_request("exit 0");
    request.restart = Some("on-failure".to_string());
    let container = rt.run_container(request).await.unwrap();

    wait_until(rt, &container.id, |c| c.status == ContainerStatus::Exited).await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(rt.inspect_container(&container.id).unwrap().restart_count, 0);
}

#[tokio::test]
async fn test_explicit_stop_is_not_undone_by_restart_policy() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let mut request = run_request("sleep 30");
    request.restart = Some("always".to_string());
    let container = rt.run_container(request).await.unwrap();

    rt.stop_container(&container.id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let info = rt.inspect_container(&container.id).unwrap();
    assert_eq!(info.status, ContainerStatus::Stopped);
    assert_eq!(info.restart_count, 0);
}

#[tokio::test]
async fn test_pause_and_unpause() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    let paused = rt.pause_container(&container.id).await.unwrap();
    assert_eq!(paused.status, ContainerStatus::Paused);
    assert!(paused.status_text.ends_with("(Paused)"));

    let err = rt.start_container(&container.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);

    let resumed = rt.unpause_container(&container.id).await.unwrap();
    assert_eq!(resumed.status, ContainerStatus::Running);

    // stopping a paused container works too
    rt.pause_container(&container.id).await.unwrap();
    let stopped = rt.stop_container(&container.id).await.unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
}

#[tokio::test]
async fn test_pause_requires_running() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    rt.stop_container(&container.id).await.unwrap();

    let err = rt.pause_container(&container.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    let err = rt.unpause_container(&container.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_start_stop_cycles_alternate() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    for _ in 0..3 {
        let stopped = rt.stop_container(&container.id).await.unwrap();
        assert_eq!(stopped.status, ContainerStatus::Stopped);
        let started = rt.start_container(&container.id).await.unwrap();
        assert_eq!(started.status, ContainerStatus::Running);
        // start on a running container is a no-op
        let again = rt.start_container(&container.id).await.unwrap();
        assert_eq!(again.status, ContainerStatus::Running);
    }
    rt.stop_container(&container.id).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_stops_serialize() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    let mut changes = rt.subscribe_changes();
    let (a, b) = tokio::join!(rt.stop_container(&container.id), rt.stop_container(&container.id));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.status, ContainerStatus::Stopped);
    assert_eq!(b.status, ContainerStatus::Stopped);

    // one termination: a single transition and a single recorded exit
    let mut stops = 0;
    while let Ok(event) = changes.try_recv() {
        if let RegistryEvent::ContainerStatusChanged { to: ContainerStatus::Stopped, .. } = event {
            stops += 1;
        }
    }
    assert_eq!(stops, 1);
    assert_eq!(a.exit_code, Some(143));
    assert_eq!(b.exit_code, a.exit_code);
    assert_eq!(a.finished_at, b.finished_at);
}

#[tokio::test]
async fn test_interleaved_start_stop_follow_the_lifecycle_graph() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    let mut changes = rt.subscribe_changes();

    let ops = (0..12).map(|i| {
        let id = container.id.clone();
        async move {
            if i % 2 == 0 {
                rt.stop_container(&id).await
            } else {
                rt.start_container(&id).await
            }
        }
    });
    for result in futures::future::join_all(ops).await {
        let info = result.unwrap();
        assert!(matches!(
            info.status,
            ContainerStatus::Running | ContainerStatus::Stopped
        ));
    }

    let mut current = ContainerStatus::Running;
    let mut edges = 0;
    while let Ok(event) = changes.try_recv() {
        if let RegistryEvent::ContainerStatusChanged { from, to, .. } = event {
            assert_eq!(from, current, "history skipped a state");
            assert!(from.can_transition_to(to), "illegal edge {} -> {}", from, to);
            current = to;
            edges += 1;
        }
    }
    assert!(edges > 0);
    assert_eq!(rt.inspect_container(&container.id).unwrap().status, current);

    rt.shutdown().await;
}

#[tokio::test]
async fn test_distinct_containers_do_not_wait_on_each_other() {
    let engine = engine().await;
    let rt = &engine.runtime;

    // ignores SIGTERM, so its stop sits out the whole grace period
    let stubborn = rt
        .run_container(run_request("trap '' TERM; echo ready; sleep 30"))
        .await
        .unwrap();
    let other = rt.run_container(run_request("sleep 30")).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while rt.recent_logs(&stubborn.id).unwrap().is_empty() {
        assert!(Instant::now() < deadline, "trap was never installed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let slow_stop = async {
        let started = Instant::now();
        let stopped = rt.stop_container(&stubborn.id).await.unwrap();
        (stopped, started.elapsed())
    };
    let other_ops = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        rt.stop_container(&other.id).await.unwrap();
        rt.start_container(&other.id).await.unwrap();
        rt.stop_container(&other.id).await.unwrap();
        started.elapsed()
    };
    let ((stopped, slow), fast) = tokio::join!(slow_stop, other_ops);

    // grace period is 2s in the test config
    assert!(slow >= Duration::from_secs(2), "stop returned after {:?}", slow);
    assert_eq!(stopped.exit_code, Some(137));
    assert!(fast < Duration::from_secs(1), "other container took {:?}", fast);
}

#[tokio::test]
async fn test_memory_limit_below_minimum_fails() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let mut request = run_request("sleep 30");
    request.name = Some("tiny".to_string());
    request.memory = Some("1m".to_string());
    let err = rt.run_container(request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendFailure);

    // the failed container is left in a terminal, inspectable state
    let containers = rt.list_containers(None).unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].status, ContainerStatus::Exited);
}

#[tokio::test]
async fn test_host_port_conflict() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let mut request = run_request("sleep 30");
    request.ports = vec!["18080:80".to_string()];
    rt.run_container(request.clone()).await.unwrap();

    let err = rt.run_container(request.clone()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
    assert!(err.message.contains("18080"));

    // udp on the same number is a different claim
    request.ports = vec!["18080:80/udp".to_string()];
    rt.run_container(request).await.unwrap();

    rt.shutdown().await;
}

#[tokio::test]
async fn test_environment_reaches_process() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let mut request = run_request("echo \"mode=$MODE\"; sleep 30");
    request.env = vec!["MODE=test".to_string()];
    let container = rt.run_container(request).await.unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let logs = rt.recent_logs(&container.id).unwrap();
        if logs.iter().any(|l| l.line == "mode=test") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "env line never appeared");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn test_stats_and_status_filter() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let running = rt.run_container(run_request("sleep 30")).await.unwrap();
    let paused = rt.run_container(run_request("sleep 30")).await.unwrap();
    rt.pause_container(&paused.id).await.unwrap();
    let stopped = rt.run_container(run_request("sleep 30")).await.unwrap();
    rt.stop_container(&stopped.id).await.unwrap();

    let stats = rt.stats();
    assert_eq!(stats.total_containers, 3);
    assert_eq!(stats.running_containers, 1);
    assert_eq!(stats.paused_containers, 1);
    assert_eq!(stats.stopped_containers, 1);
    assert_eq!(stats.total_images, 1);
    assert!(stats.cpus >= 1);
    assert_eq!(stats.backend, "process");

    let up = rt.list_containers(Some("Up 2 hours")).unwrap();
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].id, running.id);

    let err = rt.list_containers(Some("sideways")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendFailure);

    rt.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let engine = engine().await;
    let rt = &engine.runtime;

    let a = rt.run_container(run_request("sleep 30")).await.unwrap();
    let b = rt.run_container(run_request("sleep 30")).await.unwrap();
    rt.pause_container(&b.id).await.unwrap();

    rt.shutdown().await;

    for id in [&a.id, &b.id] {
        let status = rt.inspect_container(id).unwrap().status;
        assert_eq!(status, ContainerStatus::Stopped);
    }
}

#[tokio::test]
async fn test_status_changes_are_published() {
    let engine = engine().await;
    let rt = &engine.runtime;
    let mut changes = rt.subscribe_changes();

    let container = rt.run_container(run_request("sleep 30")).await.unwrap();
    rt.stop_container(&container.id).await.unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = changes.try_recv() {
        if let RegistryEvent::ContainerStatusChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (ContainerStatus::Created, ContainerStatus::Running),
            (ContainerStatus::Running, ContainerStatus::Stopped),
        ]
    );
}

#[tokio::test]
async fn test_stop_racing_a_natural_exit() {
    let engine = engine().await;
    let rt = &engine.runtime;

    for _ in 0..5 {
        let container = rt.run_container(run_request("exit 0")).await.unwrap();
        let stopped = rt.stop_container(&container.id).await.unwrap();
        assert!(matches!(
            stopped.status,
            ContainerStatus::Stopped | ContainerStatus::Exited
        ));
        wait_until(rt, &container.id, |c| c.status != ContainerStatus::Running).await;
        rt.remove_container(&container.id).await.unwrap();
    }
}
