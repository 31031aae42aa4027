//! Lifecycle integration tests against real short-lived processes

mod common;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration, Instant};

use common::*;
use nextflow_spawner_core::lifecycle::{PersistedState, ProcessState, Session};
use nextflow_spawner_core::proxy::{resolve, Resolution};

#[tokio::test]
async fn test_immediate_exit_fails_launch() {
    let manager = manager();
    let session = Session::new("alice");

    let err = manager
        .start(&session, &shell("echo broken >&2; exit 3", free_port()))
        .await
        .unwrap_err();

    assert_eq!(err.category(), "launch");
    assert_eq!(err.exit_code(), Some(3));

    let record = session.record().await.unwrap();
    assert_eq!(record.state, ProcessState::Failed);
    assert_eq!(record.exit_code, Some(3));
    assert!(record.last_error.as_deref().unwrap().contains("status 3"));
    assert!(matches!(resolve(&record), Resolution::NotReady { .. }));

    // Failed is terminal; polling does not move it
    assert_eq!(manager.poll(&session).await.unwrap(), ProcessState::Failed);
}

#[tokio::test]
async fn test_late_listener_moves_starting_to_running() {
    let manager = manager();
    let session = Session::new("alice");
    let port = free_port();

    let record = manager.start(&session, &sleeper(30, port)).await.unwrap();
    assert_eq!(record.state, ProcessState::Starting);
    assert_eq!(manager.poll(&session).await.unwrap(), ProcessState::Starting);
    assert!(!resolve(&session.record().await.unwrap()).is_ready());

    // Stand in for the backend binding its port
    let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    let state = poll_until(&manager, &session, ProcessState::Running, Duration::from_secs(5)).await;
    assert_eq!(state, ProcessState::Running);

    let resolution = resolve(&session.record().await.unwrap());
    let descriptor = resolution.descriptor().unwrap();
    assert_eq!(descriptor.port, port);
    assert_eq!(descriptor.path_prefix, "/nextflow");

    manager.stop(&session).await.unwrap();
}

#[tokio::test]
async fn test_start_twice_returns_same_record() {
    let manager = manager();
    let session = Session::new("alice");
    let invocation = sleeper(30, free_port());

    let first = manager.start(&session, &invocation).await.unwrap();
    let second = manager.start(&session, &invocation).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.pid, second.pid);

    manager.stop(&session).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_share_one_process() {
    let manager = Arc::new(manager());
    let session = Arc::new(Session::new("alice"));
    let invocation = sleeper(30, free_port());

    let (a, b) = tokio::join!(
        manager.start(&session, &invocation),
        manager.start(&session, &invocation)
    );
    assert_eq!(a.unwrap().id, b.unwrap().id);

    manager.stop(&session).await.unwrap();
}

#[tokio::test]
async fn test_stop_then_poll_is_stopped() {
    let manager = manager();
    let session = Session::new("alice");

    manager.start(&session, &sleeper(30, free_port())).await.unwrap();
    let stopped = manager.stop(&session).await.unwrap().unwrap();

    assert_eq!(stopped.state, ProcessState::Stopped);
    assert_eq!(manager.poll(&session).await.unwrap(), ProcessState::Stopped);

    // Idempotent
    let again = manager.stop(&session).await.unwrap().unwrap();
    assert_eq!(again.id, stopped.id);
    assert_eq!(again.state, ProcessState::Stopped);
}

#[tokio::test]
async fn test_restart_after_stop_creates_fresh_record() {
    let manager = manager();
    let session = Session::new("alice");
    let invocation = sleeper(30, free_port());

    let first = manager.start(&session, &invocation).await.unwrap();
    manager.stop(&session).await.unwrap();
    let second = manager.start(&session, &invocation).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(second.state, ProcessState::Starting);

    manager.stop(&session).await.unwrap();
}

#[tokio::test]
async fn test_stop_escalates_when_sigterm_is_ignored() {
    let manager = manager();
    let session = Session::new("alice");

    manager
        .start(
            &session,
            &shell("trap '' TERM; while true; do sleep 1; done", free_port()),
        )
        .await
        .unwrap();

    let begun = Instant::now();
    let record = manager.stop(&session).await.unwrap().unwrap();
    let elapsed = begun.elapsed();

    assert_eq!(record.state, ProcessState::Stopped);
    assert!(elapsed >= Duration::from_millis(900), "stopped too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(8), "escalation took {:?}", elapsed);
}

#[tokio::test]
async fn test_process_dying_while_running_fails() {
    let manager = manager();
    let session = Session::new("alice");
    let port = free_port();
    let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    manager
        .start(&session, &shell("sleep 1; exit 7", port))
        .await
        .unwrap();
    assert_eq!(manager.poll(&session).await.unwrap(), ProcessState::Running);

    let state = poll_until(&manager, &session, ProcessState::Failed, Duration::from_secs(5)).await;
    assert_eq!(state, ProcessState::Failed);

    let record = session.record().await.unwrap();
    assert_eq!(record.exit_code, Some(7));
    assert_eq!(record.failure().unwrap().category(), "runtime_failure");
}

#[tokio::test]
async fn test_load_state_reattaches_live_process() {
    let manager = manager();
    let owner = Session::new("alice");
    let port = free_port();

    manager.start(&owner, &sleeper(30, port)).await.unwrap();
    let state = manager.get_state(&owner).await.unwrap().unwrap();

    let restored = Session::new("alice");
    let record = manager.load_state(&restored, &state).await.unwrap();
    assert_eq!(record.state, ProcessState::Starting);

    let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let polled =
        poll_until(&manager, &restored, ProcessState::Running, Duration::from_secs(5)).await;
    assert_eq!(polled, ProcessState::Running);

    let stopped = manager.stop(&restored).await.unwrap().unwrap();
    assert_eq!(stopped.state, ProcessState::Stopped);

    manager.stop(&owner).await.unwrap();
}

#[tokio::test]
async fn test_load_state_of_dead_process_is_stale() {
    let manager = manager();

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    let state = PersistedState::from_json_str(&format!(
        r#"{{"pid": {}, "port": 1, "state": "running", "executable": "true"}}"#,
        pid
    ))
    .unwrap();

    let session = Session::new("alice");
    let record = manager.load_state(&session, &state).await.unwrap();

    assert_eq!(record.state, ProcessState::Failed);
    assert_eq!(record.failure().unwrap().category(), "stale_state");
    assert!(matches!(resolve(&record), Resolution::NotReady { .. }));
}

#[tokio::test]
async fn test_load_state_of_reused_pid_is_stale() {
    let manager = manager();

    // A live pid that is not a Nextflow process started at the recorded time
    let state = PersistedState::from_json_str(&format!(
        r#"{{"pid": {}, "port": 1, "state": "running", "executable": "nextflow",
            "started_at": "2001-01-01T00:00:00Z"}}"#,
        std::process::id()
    ))
    .unwrap();

    let session = Session::new("alice");
    let record = manager.load_state(&session, &state).await.unwrap();

    assert_eq!(record.state, ProcessState::Failed);
    assert_eq!(record.failure().unwrap().category(), "stale_state");

    // The record is never trusted, so stop has nothing to signal
    manager.stop(&session).await.unwrap();
    assert_eq!(session.state().await, ProcessState::Failed);
}

#[tokio::test]
async fn test_load_state_into_active_session_is_rejected() {
    let manager = manager();
    let session = Session::new("alice");
    manager.start(&session, &sleeper(30, free_port())).await.unwrap();

    let state = manager.get_state(&session).await.unwrap().unwrap();
    let err = manager.load_state(&session, &state).await.unwrap_err();
    assert_eq!(err.category(), "state_transition");

    manager.stop(&session).await.unwrap();
}

#[tokio::test]
async fn test_stop_during_starting_is_deterministic() {
    let manager = Arc::new(manager());
    let session = Arc::new(Session::new("alice"));

    manager.start(&session, &sleeper(30, free_port())).await.unwrap();

    let poller = {
        let manager = manager.clone();
        let session = session.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                let _ = manager.poll(&session).await;
                sleep(Duration::from_millis(20)).await;
            }
        })
    };

    manager.stop(&session).await.unwrap();
    poller.await.unwrap();

    assert_eq!(session.state().await, ProcessState::Stopped);
}
