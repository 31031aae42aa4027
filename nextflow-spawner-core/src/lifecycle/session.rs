use tokio::process::Child;
use tokio::sync::{Mutex, MutexGuard};

use super::record::{ProcessRecord, ProcessState};

/// Per-user context passed to every lifecycle operation.
///
/// Holds at most one [`ProcessRecord`] and, for processes launched by this process, the
/// child handle. Both sit behind one mutex, so operations on a session never interleave.
#[derive(Debug)]
pub struct Session {
    user: String,
    inner: Mutex<SessionInner>,
}

#[derive(Debug, Default)]
pub(crate) struct SessionInner {
    pub record: Option<ProcessRecord>,
    pub child: Option<Child>,
}

impl Session {
    pub fn new<S: Into<String>>(user: S) -> Self {
        Self {
            user: user.into(),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Snapshot of the current record
    pub async fn record(&self) -> Option<ProcessRecord> {
        self.inner.lock().await.record.clone()
    }

    /// Current state, `NotStarted` when no record exists
    pub async fn state(&self) -> ProcessState {
        self.inner
            .lock()
            .await
            .record
            .as_ref()
            .map(|r| r.state)
            .unwrap_or(ProcessState::NotStarted)
    }

    /// Record of a Starting or Running process, if any
    pub async fn active_record(&self) -> Option<ProcessRecord> {
        self.inner
            .lock()
            .await
            .record
            .as_ref()
            .filter(|r| r.state.is_active())
            .cloned()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }
}
