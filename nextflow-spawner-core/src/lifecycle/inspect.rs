use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tracing::debug;

use super::record::ProcessRecord;

/// What the OS says about a recorded pid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited,
    /// The pid is alive but belongs to a different process
    Replaced { reason: String },
}

/// Checks recorded pids against the OS process table
pub trait ProcessInspector: Send + Sync {
    fn inspect(&self, record: &ProcessRecord) -> Liveness;
}

/// [`ProcessInspector`] backed by `sysinfo`
#[derive(Debug, Clone)]
pub struct SystemInspector {
    tolerance: Duration,
}

impl SystemInspector {
    pub fn new(tolerance: Duration) -> Self {
        Self { tolerance }
    }
}

impl ProcessInspector for SystemInspector {
    fn inspect(&self, record: &ProcessRecord) -> Liveness {
        let Some(raw_pid) = record.pid else {
            return Liveness::Exited;
        };
        let pid = Pid::from_u32(raw_pid);

        let mut system = System::new();
        if !system.refresh_process(pid) {
            return Liveness::Exited;
        }
        let Some(process) = system.process(pid) else {
            return Liveness::Exited;
        };
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            debug!("pid {} is a zombie", raw_pid);
            return Liveness::Exited;
        }

        let recorded_start = record.started_at.timestamp();
        if recorded_start > 0 {
            let drift = (process.start_time() as i64 - recorded_start).unsigned_abs();
            if drift > self.tolerance.as_secs() {
                return Liveness::Replaced {
                    reason: format!(
                        "pid {} was started {}s away from the recorded start time",
                        raw_pid, drift
                    ),
                };
            }
        }

        if !record.executable.is_empty() {
            let expected = Path::new(&record.executable)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| record.executable.clone());
            let matches = process.name().contains(expected.as_str())
                || process.cmd().iter().any(|arg| arg.contains(expected.as_str()));
            if !matches {
                return Liveness::Replaced {
                    reason: format!(
                        "pid {} is running '{}', not '{}'",
                        raw_pid,
                        process.name(),
                        expected
                    ),
                };
            }
        }

        Liveness::Alive
    }
}
