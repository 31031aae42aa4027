use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::inspect::{Liveness, ProcessInspector, SystemInspector};
use super::probe::{ReadinessProbe, TcpProbe};
use super::record::{FailureKind, PersistedState, ProcessRecord, ProcessState};
use super::session::{Session, SessionInner};
use crate::account::hand_over;
use crate::command::Invocation;
use crate::config::{LifecycleSettings, OutputLoggingConfig};
use crate::{Error, Result};

/// Bound on waiting for a process after SIGKILL
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between liveness checks of a process without a child handle
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drives the per-session process state machine
pub struct LifecycleManager {
    settings: LifecycleSettings,
    output_logging: OutputLoggingConfig,
    probe: Arc<dyn ReadinessProbe>,
    inspector: Arc<dyn ProcessInspector>,
}

impl LifecycleManager {
    /// Create a manager with the TCP readiness probe and the `sysinfo` inspector
    pub fn new(settings: LifecycleSettings, output_logging: OutputLoggingConfig) -> Self {
        let probe = Arc::new(TcpProbe::new(settings.probe_timeout()));
        let inspector = Arc::new(SystemInspector::new(settings.start_time_tolerance()));
        Self {
            settings,
            output_logging,
            probe,
            inspector,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ProcessInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Launch `invocation` for `session`.
    ///
    /// Returns the existing record when the session already has a Starting or Running
    /// process. A stop left unfinished is completed first. Does not wait for readiness;
    /// see [`LifecycleManager::poll`].
    pub async fn start(
        &self,
        session: &Session,
        invocation: &Invocation,
    ) -> Result<ProcessRecord> {
        let mut inner = session.lock().await;

        match inner.record.as_ref().map(|r| r.state) {
            Some(ProcessState::Starting | ProcessState::Running) => {
                let record = inner
                    .record
                    .clone()
                    .ok_or_else(|| Error::Internal("active record vanished".to_string()))?;
                debug!(
                    "Session {} already has process {} in state {}",
                    session.user(),
                    record.id,
                    record.state
                );
                return Ok(record);
            }
            Some(ProcessState::Stopping) => {
                info!("Finishing interrupted stop for {}", session.user());
                self.stop_locked(&mut inner, session.user()).await;
            }
            _ => {}
        }
        inner.child = None;

        info!(
            "Launching {} for user {}",
            invocation.executable,
            session.user()
        );
        debug!("Command: {}", invocation.command_line());
        trace!("Environment: {:?}, cwd: {}", invocation.env, invocation.cwd.display());

        let child = match self.spawn(session.user(), invocation).await {
            Ok(child) => child,
            Err(reason) => {
                error!("Failed to launch process for {}: {}", session.user(), reason);
                let mut record = ProcessRecord::launching(invocation, None);
                record.mark_failed(FailureKind::Launch, reason.clone(), None);
                inner.record = Some(record);
                return Err(Error::launch(reason, None));
            }
        };

        let record = ProcessRecord::launching(invocation, child.id());
        inner.record = Some(record);
        inner.child = Some(child);

        self.await_launch_grace(&mut inner, session.user()).await?;

        let record = inner
            .record
            .clone()
            .ok_or_else(|| Error::Internal("launched record vanished".to_string()))?;
        info!(
            "Process {} (pid {:?}) for {} is starting on {}:{}",
            record.id,
            record.pid,
            session.user(),
            record.listen_host,
            record.listen_port
        );
        Ok(record)
    }

    /// Refresh liveness and readiness of the session's process
    pub async fn poll(&self, session: &Session) -> Result<ProcessState> {
        let mut inner = session.lock().await;
        let SessionInner { record, child } = &mut *inner;

        let Some(record) = record.as_mut() else {
            return Ok(ProcessState::NotStarted);
        };
        if !record.state.is_active() {
            return Ok(record.state);
        }

        if let Some((reason, exit_code)) = self.check_exit(record, child) {
            let kind = match record.state {
                ProcessState::Starting => FailureKind::Launch,
                _ => FailureKind::Runtime,
            };
            warn!("Process {} for {} died: {}", record.id, session.user(), reason);
            record.mark_failed(kind, reason, exit_code);
            *child = None;
            return Ok(record.state);
        }

        let ready = self
            .probe
            .is_ready(&record.listen_host, record.listen_port)
            .await;

        match (record.state, ready) {
            (ProcessState::Starting, true) => {
                record.state = ProcessState::Running;
                info!(
                    "Process {} for {} is running on {}:{}",
                    record.id,
                    session.user(),
                    record.listen_host,
                    record.listen_port
                );
            }
            (ProcessState::Starting, false) => {
                let age = record.age().to_std().unwrap_or_default();
                if age > self.settings.start_timeout() {
                    warn!(
                        "Process {} for {} not ready after {:?}, terminating",
                        record.id,
                        session.user(),
                        self.settings.start_timeout()
                    );
                    self.terminate(record, child).await;
                    *child = None;
                    record.mark_failed(
                        FailureKind::Launch,
                        format!(
                            "backend did not become ready within {}s",
                            self.settings.start_timeout_secs
                        ),
                        None,
                    );
                } else {
                    trace!("Process {} not ready yet", record.id);
                }
            }
            (ProcessState::Running, false) => {
                warn!(
                    "Process {} for {} is alive but {}:{} does not accept connections",
                    record.id,
                    session.user(),
                    record.listen_host,
                    record.listen_port
                );
            }
            _ => {}
        }

        Ok(record.state)
    }

    /// Stop the session's process: SIGTERM, then SIGKILL after the stop timeout.
    ///
    /// A no-op for sessions without a process or with a terminal record.
    /// Dropping the returned future mid-escalation kills the process group and still
    /// leaves the record Stopped.
    pub async fn stop(&self, session: &Session) -> Result<Option<ProcessRecord>> {
        let mut inner = session.lock().await;

        let Some(record) = inner.record.as_ref() else {
            debug!("Nothing to stop for {}", session.user());
            return Ok(None);
        };
        if record.state.is_terminal() {
            debug!(
                "Process {} for {} already {}",
                record.id,
                session.user(),
                record.state
            );
            return Ok(Some(record.clone()));
        }

        self.stop_locked(&mut inner, session.user()).await;
        Ok(inner.record.clone())
    }

    /// Terminate the session's non-terminal process and mark it Stopped
    async fn stop_locked(&self, inner: &mut SessionInner, user: &str) {
        let SessionInner { record, child } = inner;
        let Some(record) = record.as_mut() else {
            return;
        };

        info!("Stopping process {} for {}", record.id, user);
        record.state = ProcessState::Stopping;
        let mut pending = PendingStop {
            record,
            child,
            done: false,
        };
        self.terminate(&*pending.record, &mut *pending.child).await;
        pending.finish();
    }

    /// Serialise the session's record
    pub async fn get_state(&self, session: &Session) -> Result<Option<PersistedState>> {
        let inner = session.lock().await;
        inner
            .record
            .as_ref()
            .map(PersistedState::from_record)
            .transpose()
    }

    /// Restore a record, re-validating any non-terminal process against the OS
    pub async fn load_state(
        &self,
        session: &Session,
        state: &PersistedState,
    ) -> Result<ProcessRecord> {
        let mut record = state.to_record()?;

        let mut inner = session.lock().await;
        if let Some(existing) = &inner.record {
            if !existing.state.is_terminal() {
                return Err(Error::state_transition(format!(
                    "session {} already tracks process {} in state {}",
                    session.user(),
                    existing.id,
                    existing.state
                )));
            }
        }

        if matches!(
            record.state,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        ) {
            match self.inspector.inspect(&record) {
                Liveness::Alive => {
                    info!(
                        "Re-attached to process {} (pid {:?}) for {}",
                        record.id,
                        record.pid,
                        session.user()
                    );
                }
                Liveness::Exited => {
                    let reason = format!(
                        "process {:?} from saved state is no longer running",
                        record.pid
                    );
                    warn!("Stale state for {}: {}", session.user(), reason);
                    record.mark_failed(FailureKind::StaleState, reason, None);
                }
                Liveness::Replaced { reason } => {
                    warn!("Stale state for {}: {}", session.user(), reason);
                    record.mark_failed(FailureKind::StaleState, reason, None);
                }
            }
        }

        inner.child = None;
        inner.record = Some(record.clone());
        Ok(record)
    }

    async fn spawn(
        &self,
        user: &str,
        invocation: &Invocation,
    ) -> std::result::Result<Child, String> {
        if let Some(params) = &invocation.params_file {
            if let Some(dir) = params.path.parent() {
                if !fs::try_exists(dir).await.unwrap_or(false) {
                    fs::create_dir_all(dir)
                        .await
                        .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
                    hand_over(dir, invocation.identity).map_err(|e| e.to_string())?;
                }
            }
            fs::write(&params.path, &params.contents)
                .await
                .map_err(|e| {
                    format!("cannot write params file {}: {}", params.path.display(), e)
                })?;
            hand_over(&params.path, invocation.identity).map_err(|e| e.to_string())?;
            debug!("Wrote params file {}", params.path.display());
        }

        let (stdout, stderr) = self.output_streams(user).await?;

        let mut command = Command::new(&invocation.executable);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        {
            command.process_group(0);
            if let Some(identity) = invocation.identity {
                debug!(
                    "Dropping to uid {} gid {} for {}",
                    identity.uid, identity.gid, user
                );
                command.uid(identity.uid).gid(identity.gid);
            }
        }

        command
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", invocation.executable, e))
    }

    async fn output_streams(&self, user: &str) -> std::result::Result<(Stdio, Stdio), String> {
        let log_dir = match (&self.output_logging.enabled, &self.output_logging.log_directory) {
            (true, Some(dir)) => dir,
            _ => return Ok((Stdio::null(), Stdio::null())),
        };
        fs::create_dir_all(log_dir)
            .await
            .map_err(|e| format!("cannot create log directory {}: {}", log_dir.display(), e))?;

        let mut streams = Vec::with_capacity(2);
        for suffix in ["stdout", "stderr"] {
            let path = log_dir.join(format!("nextflow-{}-{}.log", user, suffix));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
            streams.push(Stdio::from(file.into_std().await));
        }
        let stderr = streams.pop();
        let stdout = streams.pop();
        match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => Ok((stdout, stderr)),
            _ => Err("output streams missing".to_string()),
        }
    }

    /// Fail the launch if the child exits within the grace window
    async fn await_launch_grace(&self, inner: &mut SessionInner, user: &str) -> Result<()> {
        let SessionInner { record, child } = inner;
        let (Some(record), Some(handle)) = (record.as_mut(), child.as_mut()) else {
            return Ok(());
        };

        let (reason, exit_code) = match timeout(self.settings.launch_grace(), handle.wait()).await {
            Err(_) => return Ok(()),
            Ok(Ok(status)) => (describe_exit(status), status.code()),
            Ok(Err(e)) => (format!("cannot wait for process: {}", e), None),
        };

        error!("Process for {} exited during launch: {}", user, reason);
        record.mark_failed(FailureKind::Launch, reason.clone(), exit_code);
        *child = None;
        Err(Error::launch(reason, exit_code))
    }

    /// Exit reason and code when the process is gone
    fn check_exit(
        &self,
        record: &ProcessRecord,
        child: &mut Option<Child>,
    ) -> Option<(String, Option<i32>)> {
        match child {
            Some(handle) => match handle.try_wait() {
                Ok(Some(status)) => Some((describe_exit(status), status.code())),
                Ok(None) => None,
                Err(e) => Some((format!("cannot query process status: {}", e), None)),
            },
            None => match self.inspector.inspect(record) {
                Liveness::Alive => None,
                Liveness::Exited => Some((
                    format!("process {:?} is no longer running", record.pid),
                    None,
                )),
                Liveness::Replaced { reason } => Some((reason, None)),
            },
        }
    }

    /// SIGTERM, wait up to the stop timeout, then SIGKILL and reap
    async fn terminate(&self, record: &ProcessRecord, child: &mut Option<Child>) {
        let Some(pid) = record.pid else {
            return;
        };
        if matches!(child.as_mut().map(|c| c.try_wait()), Some(Ok(Some(_)))) {
            debug!("Process {} already exited", pid);
            return;
        }

        if !signal(pid, Signal::Term) {
            debug!("SIGTERM to {} not delivered, process may already be gone", pid);
        }

        let stop_timeout = self.settings.stop_timeout();
        let exited = match child.as_mut() {
            Some(handle) => match timeout(stop_timeout, handle.wait()).await {
                Ok(Ok(status)) => {
                    info!("Process {} exited gracefully with status: {:?}", pid, status);
                    true
                }
                Ok(Err(e)) => {
                    warn!("Waiting for process {} failed: {}", pid, e);
                    false
                }
                Err(_) => false,
            },
            None => self.wait_for_exit(record, stop_timeout).await,
        };
        if exited {
            return;
        }

        warn!(
            "Process {} did not respond to SIGTERM within {:?}, forcing termination",
            pid, stop_timeout
        );
        signal(pid, Signal::Kill);

        match child.as_mut() {
            Some(handle) => {
                if let Err(e) = handle.start_kill() {
                    debug!("Direct kill of {} failed: {}", pid, e);
                }
                match timeout(KILL_REAP_TIMEOUT, handle.wait()).await {
                    Ok(Ok(status)) => {
                        info!("Process {} force killed and reaped with status: {:?}", pid, status)
                    }
                    _ => warn!("Process {} force killed but reaping failed", pid),
                }
            }
            None => {
                if !self.wait_for_exit(record, KILL_REAP_TIMEOUT).await {
                    warn!("Process {} still present after SIGKILL", pid);
                }
            }
        }
    }

    /// Poll the inspector until the process is gone or `limit` passes
    async fn wait_for_exit(&self, record: &ProcessRecord, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.inspector.inspect(record) != Liveness::Alive {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

/// Stop in progress on a locked session.
///
/// If the owning future is dropped before [`PendingStop::finish`], the process group is
/// killed outright and the record still ends Stopped.
struct PendingStop<'a> {
    record: &'a mut ProcessRecord,
    child: &'a mut Option<Child>,
    done: bool,
}

impl PendingStop<'_> {
    fn finish(mut self) {
        *self.child = None;
        self.record.state = ProcessState::Stopped;
        self.done = true;
        info!("Process {} stopped", self.record.id);
    }
}

impl Drop for PendingStop<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("Stop of process {} interrupted, killing it", self.record.id);
        if let Some(pid) = self.record.pid {
            signal(pid, Signal::Kill);
        }
        if let Some(mut handle) = self.child.take() {
            if let Err(e) = handle.start_kill() {
                debug!("Direct kill of {:?} failed: {}", self.record.pid, e);
            }
        }
        self.record.state = ProcessState::Stopped;
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("process exited with status {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("process terminated by signal {}", sig);
        }
    }
    "process exited".to_string()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`, falling back to the pid alone
#[cfg(unix)]
fn signal(pid: u32, signal: Signal) -> bool {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(-pid, sig) == 0 || libc::kill(pid, sig) == 0 }
}

#[cfg(not(unix))]
fn signal(_pid: u32, _signal: Signal) -> bool {
    false
}
