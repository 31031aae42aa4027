use nextflow_spawner_core::{check_username, PersistedState};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Interval between attempts on a contended user lock
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Per-user process state files: `<dir>/<user>.json`
///
/// Commands that read, act on and write back a user's state hold `<dir>/<user>.lock`
/// for the whole sequence, so concurrent invocations for one user run one at a time.
pub struct StateStore {
    dir: PathBuf,
}

/// Exclusive `flock` on a user's lock file, released on drop
///
/// The lock file itself stays in place; removing it would let a waiter lock an unlinked
/// inode while a newcomer locks a fresh one.
#[derive(Debug)]
pub struct UserLock {
    file: std::fs::File,
    path: PathBuf,
}

impl Drop for UserLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor belongs to `self.file`, which is still open
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!("Released {}", self.path.display());
    }
}

impl StateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self, user: &str) -> Result<PathBuf> {
        self.file(user, "json")
    }

    fn file(&self, user: &str, extension: &str) -> Result<PathBuf> {
        check_username(user).map_err(|e| Error::StateStore(e.to_string()))?;
        Ok(self.dir.join(format!("{}.{}", user, extension)))
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::StateStore(format!("Failed to create state directory: {}", e)))
    }

    /// Take the user's lock, waiting up to `timeout` for another holder to finish
    pub async fn lock(&self, user: &str, timeout: Duration) -> Result<UserLock> {
        let path = self.file(user, "lock")?;
        self.ensure_dir().await?;

        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| {
                Error::StateStore(format!("Cannot open lock file {}: {}", path.display(), e))
            })?
            .into_std()
            .await;
        let fd = file.as_raw_fd();
        let deadline = Instant::now() + timeout;

        let mut waited = false;
        loop {
            // SAFETY: `fd` stays valid while `file` is alive
            let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if ret == 0 {
                debug!("Locked {}", path.display());
                return Ok(UserLock { file, path });
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(Error::StateStore(format!(
                    "Cannot lock {}: {}",
                    path.display(),
                    err
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::StateStore(format!(
                    "Timed out waiting for lock {} after {:?}",
                    path.display(),
                    timeout
                )));
            }
            if !waited {
                warn!("Waiting for another command on user {}", user);
                waited = true;
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    pub async fn save(&self, user: &str, state: &PersistedState) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.path(user)?;
        let content = state.to_json_string()?;
        fs::write(&path, content)
            .await
            .map_err(|e| Error::StateStore(format!("Failed to write state file: {}", e)))?;

        debug!("Saved state for {} to {}", user, path.display());
        Ok(())
    }

    pub async fn load(&self, user: &str) -> Result<Option<PersistedState>> {
        let path = self.path(user)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::StateStore(format!(
                    "Failed to read state file: {}",
                    e
                )))
            }
        };
        let state = PersistedState::from_json_str(&content)?;
        Ok(Some(state))
    }

    pub async fn remove(&self, user: &str) -> Result<()> {
        let path = self.path(user)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed state file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StateStore(format!(
                "Failed to remove state file: {}",
                e
            ))),
        }
    }
}
