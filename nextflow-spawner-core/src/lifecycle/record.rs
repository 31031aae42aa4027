use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::command::Invocation;
use crate::{Error, Result};

/// Lifecycle state of a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    /// Starting or Running
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not_started"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a record ended up Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Launch,
    Runtime,
    StaleState,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// The single persisted entity: one backend process and what is known about it.
///
/// Serialises to the flat state object handed to the hub. A missing `started_at` decodes
/// as the Unix epoch, which disables the start-time check on re-attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub pid: Option<u32>,
    pub state: ProcessState,
    #[serde(default)]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "host", default = "default_host")]
    pub listen_host: String,
    #[serde(rename = "port")]
    pub listen_port: u16,
    #[serde(rename = "path", default)]
    pub listen_path: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub executable: String,
}

impl ProcessRecord {
    /// Fresh record for a launch of `invocation`
    pub(crate) fn launching(invocation: &Invocation, pid: Option<u32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid,
            state: ProcessState::Starting,
            started_at: Utc::now(),
            listen_host: invocation.endpoint.host.clone(),
            listen_port: invocation.endpoint.port,
            listen_path: invocation.endpoint.path.clone(),
            last_error: None,
            exit_code: None,
            failure: None,
            executable: invocation.executable.clone(),
        }
    }

    pub(crate) fn mark_failed<S: Into<String>>(
        &mut self,
        kind: FailureKind,
        reason: S,
        exit_code: Option<i32>,
    ) {
        self.state = ProcessState::Failed;
        self.failure = Some(kind);
        self.last_error = Some(reason.into());
        self.exit_code = exit_code;
    }

    /// Failure of a Failed record as an error value
    pub fn failure(&self) -> Option<Error> {
        if self.state != ProcessState::Failed {
            return None;
        }
        let reason = self
            .last_error
            .clone()
            .unwrap_or_else(|| "process failed".to_string());
        Some(match self.failure.unwrap_or(FailureKind::Runtime) {
            FailureKind::Launch => Error::launch(reason, self.exit_code),
            FailureKind::Runtime => Error::runtime_failure(reason, self.exit_code),
            FailureKind::StaleState => Error::stale_state(reason),
        })
    }

    /// Time since the record was created
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// Flat key/value form of a [`ProcessRecord`] as stored by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedState(Map<String, Value>);

impl PersistedState {
    pub fn from_record(record: &ProcessRecord) -> Result<Self> {
        match serde_json::to_value(record)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Internal(format!(
                "process record serialised to non-object {}",
                other
            ))),
        }
    }

    /// Decode the record; unknown keys are ignored
    pub fn to_record(&self) -> Result<ProcessRecord> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.0)?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Map<String, Value>> for PersistedState {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ListenEndpoint;
    use serde_json::json;
    use std::path::PathBuf;

    fn record() -> ProcessRecord {
        let invocation = Invocation::new(
            "nextflow",
            PathBuf::from("/tmp"),
            ListenEndpoint {
                host: "127.0.0.1".to_string(),
                port: 41000,
                path: "/nextflow".to_string(),
            },
        );
        ProcessRecord::launching(&invocation, Some(4242))
    }

    #[test]
    fn test_state_display_and_terminal() {
        assert_eq!(ProcessState::NotStarted.to_string(), "not_started");
        assert!(ProcessState::Stopped.is_terminal());
        assert!(ProcessState::Failed.is_terminal());
        assert!(!ProcessState::Stopping.is_terminal());
        assert!(ProcessState::Running.is_active());
        assert!(!ProcessState::Stopping.is_active());
    }

    #[test]
    fn test_failure_error() {
        let mut record = record();
        assert!(record.failure().is_none());

        record.mark_failed(FailureKind::Launch, "process exited with status 1", Some(1));
        let err = record.failure().unwrap();
        assert_eq!(err.category(), "launch");
        assert_eq!(err.exit_code(), Some(1));

        record.mark_failed(FailureKind::StaleState, "pid reused", None);
        assert_eq!(record.failure().unwrap().category(), "stale_state");
    }

    #[test]
    fn test_persisted_state_is_flat() {
        let record = record();
        let state = PersistedState::from_record(&record).unwrap();

        assert_eq!(state.get("pid"), Some(&json!(4242)));
        assert_eq!(state.get("port"), Some(&json!(41000)));
        assert_eq!(state.get("path"), Some(&json!("/nextflow")));
        assert_eq!(state.get("state"), Some(&json!("starting")));
        assert_eq!(state.to_record().unwrap(), record);
    }

    #[test]
    fn test_old_state_blob_is_readable() {
        let state = PersistedState::from_json_str(
            r#"{"pid": 99, "port": 8080, "state": "running", "legacy": true}"#,
        )
        .unwrap();
        let record = state.to_record().unwrap();

        assert_eq!(record.pid, Some(99));
        assert_eq!(record.listen_port, 8080);
        assert_eq!(record.listen_host, "127.0.0.1");
        assert_eq!(record.listen_path, "");
        assert_eq!(record.started_at.timestamp(), 0);
        assert!(record.executable.is_empty());
    }

    #[test]
    fn test_missing_port_is_rejected() {
        let state = PersistedState::from_json_str(r#"{"pid": 99, "state": "running"}"#).unwrap();
        assert!(state.to_record().is_err());
    }
}
