//! Proxy-facing view of a backend process
//!
//! [`resolve`] tells a reverse proxy where a Running backend listens. [`ignite`] is the
//! alternative entry point for proxies that launch the backend themselves over a unix
//! socket, built from the `NXF_USER_*` environment the command builder exports.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::lifecycle::{ProcessRecord, ProcessState};
use crate::{Error, Result};

/// How long a proxy waits for the backend to answer its readiness check
pub const PROXY_TIMEOUT_SECS: u64 = 120;

const LAUNCHER_TITLE: &str = "Nextflow";

/// HTTP readiness check a proxy can perform before routing traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyCheck {
    pub path: String,
    pub timeout_secs: u64,
}

impl ReadyCheck {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where to route a user's traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub host: String,
    pub port: u16,
    pub path_prefix: String,
    pub ready_check: ReadyCheck,
}

impl ProxyDescriptor {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Ready(ProxyDescriptor),
    NotReady { state: ProcessState },
}

impl Resolution {
    pub fn is_ready(&self) -> bool {
        matches!(self, Resolution::Ready(_))
    }

    pub fn descriptor(&self) -> Option<&ProxyDescriptor> {
        match self {
            Resolution::Ready(descriptor) => Some(descriptor),
            Resolution::NotReady { .. } => None,
        }
    }
}

/// Resolve a record to a proxy descriptor; only Running records are routable
pub fn resolve(record: &ProcessRecord) -> Resolution {
    if record.state != ProcessState::Running {
        return Resolution::NotReady {
            state: record.state,
        };
    }

    let path_prefix = if record.listen_path.is_empty() {
        "/".to_string()
    } else {
        record.listen_path.clone()
    };

    Resolution::Ready(ProxyDescriptor {
        host: record.listen_host.clone(),
        port: record.listen_port,
        ready_check: ReadyCheck {
            path: path_prefix.clone(),
            timeout_secs: PROXY_TIMEOUT_SECS,
        },
        path_prefix,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherEntry {
    pub title: String,
}

/// Server-proxy process description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCommand {
    pub command: Vec<String>,
    pub timeout: u64,
    pub launcher_entry: LauncherEntry,
    pub unix_socket: bool,
    pub raw_socket_proxy: bool,
}

/// Build the proxy command from the process environment
pub fn ignite() -> Result<ProxyCommand> {
    ignite_from(|key| std::env::var(key).ok())
}

/// Build the proxy command from an arbitrary variable lookup.
///
/// `{unix_socket}` is left for the proxy to fill in.
pub fn ignite_from<F>(lookup: F) -> Result<ProxyCommand>
where
    F: Fn(&str) -> Option<String>,
{
    let workflow = lookup("NXF_USER_WORKFLOW")
        .filter(|w| !w.is_empty())
        .ok_or_else(|| Error::configuration("NXF_USER_WORKFLOW is not set"))?;

    let mut command = vec![
        "nextflow".to_string(),
        "run".to_string(),
        workflow,
        "--SOCKET={unix_socket}".to_string(),
        "-resume".to_string(),
    ];
    for (var, flag) in [
        ("NXF_USER_REVISION", "-r"),
        ("NXF_USER_PARAMS", "-params-file"),
        ("NXF_USER_ENDPOINT", "-with-weblog"),
        ("NXF_USER_PROFILE", "-profile"),
    ] {
        if let Some(value) = lookup(var) {
            command.push(flag.to_string());
            command.push(value);
        }
    }

    Ok(ProxyCommand {
        command,
        timeout: PROXY_TIMEOUT_SECS,
        launcher_entry: LauncherEntry {
            title: LAUNCHER_TITLE.to_string(),
        },
        unix_socket: true,
        raw_socket_proxy: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PersistedState;
    use serde_json::json;
    use std::collections::HashMap;

    fn record(state: &str) -> ProcessRecord {
        PersistedState::from_json_str(
            &json!({"pid": 10, "state": state, "port": 41234, "path": "/nextflow"}).to_string(),
        )
        .unwrap()
        .to_record()
        .unwrap()
    }

    #[test]
    fn test_resolve_running() {
        let resolution = resolve(&record("running"));
        let descriptor = resolution.descriptor().unwrap();

        assert_eq!(descriptor.host, "127.0.0.1");
        assert_eq!(descriptor.port, 41234);
        assert_eq!(descriptor.path_prefix, "/nextflow");
        assert_eq!(descriptor.ready_check.path, "/nextflow");
        assert_eq!(descriptor.ready_check.timeout(), Duration::from_secs(120));
        assert_eq!(descriptor.url(), "http://127.0.0.1:41234/nextflow");
    }

    #[test]
    fn test_resolve_not_running() {
        for state in ["starting", "stopping", "stopped", "failed"] {
            let resolution = resolve(&record(state));
            assert!(!resolution.is_ready());
            assert!(matches!(resolution, Resolution::NotReady { .. }));
        }
        assert_eq!(
            resolve(&record("failed")),
            Resolution::NotReady {
                state: ProcessState::Failed
            }
        );
    }

    #[test]
    fn test_ignite_full_environment() {
        let env: HashMap<&str, &str> = [
            ("NXF_USER_WORKFLOW", "https://github.com/nf-core/demo"),
            ("NXF_USER_REVISION", "1.0"),
            ("NXF_USER_PARAMS", "/home/a/.nextflow/nextflowspawner_ab.json"),
            ("NXF_USER_ENDPOINT", "http://weblog"),
            ("NXF_USER_PROFILE", "docker"),
        ]
        .into_iter()
        .collect();

        let command = ignite_from(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(
            command.command,
            vec![
                "nextflow",
                "run",
                "https://github.com/nf-core/demo",
                "--SOCKET={unix_socket}",
                "-resume",
                "-r",
                "1.0",
                "-params-file",
                "/home/a/.nextflow/nextflowspawner_ab.json",
                "-with-weblog",
                "http://weblog",
                "-profile",
                "docker",
            ]
        );
        assert_eq!(command.timeout, 120);
        assert_eq!(command.launcher_entry.title, "Nextflow");
        assert!(command.unix_socket);
        assert!(command.raw_socket_proxy);
    }

    #[test]
    fn test_ignite_minimal_and_missing_workflow() {
        let command =
            ignite_from(|k| (k == "NXF_USER_WORKFLOW").then(|| "nf-core/demo".to_string()))
                .unwrap();
        assert_eq!(command.command.len(), 5);

        let err = ignite_from(|_| None).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
