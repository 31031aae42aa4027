//! Shared helpers for the lifecycle and spawner integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration, Instant};

use nextflow_spawner_core::command::{Invocation, ListenEndpoint};
use nextflow_spawner_core::{
    LifecycleManager, LifecycleSettings, OutputLoggingConfig, ProcessState, Session,
};

/// Settings with short timeouts so escalation paths finish quickly
pub fn fast_settings() -> LifecycleSettings {
    LifecycleSettings {
        launch_grace_ms: 300,
        start_timeout_secs: 60,
        stop_timeout_secs: 1,
        probe_timeout_ms: 200,
        start_time_tolerance_secs: 5,
    }
}

pub fn manager() -> LifecycleManager {
    LifecycleManager::new(fast_settings(), OutputLoggingConfig::default())
}

pub fn endpoint(port: u16) -> ListenEndpoint {
    ListenEndpoint {
        host: "127.0.0.1".to_string(),
        port,
        path: "/nextflow".to_string(),
    }
}

/// `sh -c <script>` listening (nominally) on `port`
pub fn shell(script: &str, port: u16) -> Invocation {
    Invocation::new("sh", std::env::temp_dir(), endpoint(port))
        .arg("-c")
        .arg(script)
}

/// `sleep <secs>`, a process whose name matches its executable
pub fn sleeper(secs: u32, port: u16) -> Invocation {
    Invocation::new("sleep", std::env::temp_dir(), endpoint(port)).arg(secs.to_string())
}

/// A port nothing listens on
pub fn free_port() -> u16 {
    nextflow_spawner_core::allocate_port("127.0.0.1").unwrap()
}

/// Poll until `expected` is reached or `limit` passes, returning the last state seen
pub async fn poll_until(
    manager: &LifecycleManager,
    session: &Session,
    expected: ProcessState,
    limit: Duration,
) -> ProcessState {
    let deadline = Instant::now() + limit;
    loop {
        let state = manager.poll(session).await.unwrap();
        if state == expected || Instant::now() >= deadline {
            return state;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Write an executable stand-in for the `nextflow` launcher that records its
/// arguments in `$HOME/args.txt` and then sleeps.
///
/// The shell stays the process leader so its command line keeps naming `nextflow`.
pub fn fake_nextflow(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("nextflow");
    std::fs::write(
        &path,
        "#!/bin/sh\necho \"$@\" > \"$HOME/args.txt\"\nsleep 30\n",
    )
    .unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}
