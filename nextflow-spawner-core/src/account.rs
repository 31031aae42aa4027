//! Hub user accounts
//!
//! User names end up in paths (home directory, log and state file names), so they are
//! checked before anything else touches them. When the spawner runs as root, each backend
//! is started under the uid and gid of its hub user.

use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::path::Path;
use tracing::debug;

use crate::config::UserSwitching;
use crate::{Error, Result};

/// Buffer size for `getpwnam_r` string fields
const PASSWD_BUFFER_SIZE: usize = 16 * 1024;

/// Uid and gid a backend process runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Reject names that could escape the directories they are joined onto
pub fn check_username(user: &str) -> Result<()> {
    if user.is_empty()
        || user.starts_with('.')
        || user.contains(|c: char| c == '/' || c == '\\' || c.is_control())
    {
        return Err(Error::configuration(format!("invalid user name '{}'", user)));
    }
    Ok(())
}

/// Look up a local account in the password database
#[cfg(unix)]
pub fn lookup_user(user: &str) -> Result<Option<UserIdentity>> {
    let name = CString::new(user)
        .map_err(|_| Error::configuration(format!("invalid user name '{}'", user)))?;
    let mut buffer = vec![0 as libc::c_char; PASSWD_BUFFER_SIZE];
    // SAFETY: passwd is plain old data; getpwnam_r fills it in
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut found: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: every pointer is valid for the duration of the call and the buffer length
    // matches the buffer
    let rc = unsafe {
        libc::getpwnam_r(
            name.as_ptr(),
            &mut entry,
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut found,
        )
    };
    if rc != 0 {
        return Err(Error::Io(format!(
            "cannot look up user '{}': {}",
            user,
            std::io::Error::from_raw_os_error(rc)
        )));
    }
    if found.is_null() {
        return Ok(None);
    }
    Ok(Some(UserIdentity {
        uid: entry.pw_uid,
        gid: entry.pw_gid,
    }))
}

#[cfg(not(unix))]
pub fn lookup_user(_user: &str) -> Result<Option<UserIdentity>> {
    Ok(None)
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Identity a user's backend should run under, `None` to keep the spawner's own
pub fn identity_for(mode: UserSwitching, user: &str) -> Result<Option<UserIdentity>> {
    let switch = match mode {
        UserSwitching::Never => false,
        UserSwitching::Always => true,
        UserSwitching::Auto => running_as_root(),
    };
    if !switch {
        return Ok(None);
    }

    let identity = lookup_user(user)?
        .ok_or_else(|| Error::configuration(format!("no local account for user '{}'", user)))?;
    debug!(
        "Backend for {} runs as uid {} gid {}",
        user, identity.uid, identity.gid
    );
    Ok(Some(identity))
}

/// Hand a spawner-created path over to the backend's user
#[cfg(unix)]
pub fn hand_over(path: &Path, identity: Option<UserIdentity>) -> Result<()> {
    if let Some(identity) = identity {
        std::os::unix::fs::chown(path, Some(identity.uid), Some(identity.gid)).map_err(|e| {
            Error::Io(format!("cannot chown {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn hand_over(_path: &Path, _identity: Option<UserIdentity>) -> Result<()> {
    Ok(())
}
