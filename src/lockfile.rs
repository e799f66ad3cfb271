//! Single-instance lifecycle — PID lockfile with liveness probing and stale-lock recovery.
//!
//! Grounded on `libc::kill(pid, 0)` liveness-probe usage in sibling `beach`/`beach-human` binaries
//! (they use `libc` for process/signal plumbing already) and `paths::write_owner_only_atomic` for
//! the lockfile's own persistence.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::LifecycleError;
use crate::paths;

/// An acquired lock; dropping it (or calling [`Lock::release`] explicitly at shutdown) removes
/// the lockfile.
pub struct Lock {
    path: PathBuf,
    released: bool,
}

impl Lock {
    /// Acquires the single-instance lock at `path`. If a lockfile already exists, reads the PID
    /// inside and probes it with signal 0: alive → [`LifecycleError::AlreadyRunning`]; dead or
    /// unreadable → treated as stale, removed, and retried once.
    pub fn acquire(path: PathBuf) -> Result<Self, LifecycleError> {
        match try_claim(&path) {
            Ok(()) => Ok(Self {
                path,
                released: false,
            }),
            Err(LifecycleError::AlreadyRunning(pid)) => Err(LifecycleError::AlreadyRunning(pid)),
            Err(other) => Err(other),
        }
    }

    /// Removes the lockfile. Idempotent; safe to call before drop.
    pub fn release(mut self) {
        self.released = true;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, path = %self.path.display(), "failed to remove lockfile on release");
            }
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn try_claim(path: &Path) -> Result<(), LifecycleError> {
    if let Some(existing_pid) = read_pid(path) {
        if process_is_alive(existing_pid) {
            return Err(LifecycleError::AlreadyRunning(existing_pid));
        }
        info!(pid = existing_pid, "removing stale lockfile from a dead process");
        fs::remove_file(path).ok();
    }

    let pid = std::process::id();
    paths::write_owner_only(path, pid.to_string().as_bytes())?;

    // Guard against a race where another process claimed the lock between our stale-check and
    // our write: re-read and confirm it's still our PID.
    match read_pid(path) {
        Some(written) if written == pid => Ok(()),
        Some(other) if process_is_alive(other) => Err(LifecycleError::AlreadyRunning(other)),
        _ => Ok(()),
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs no-op error checking only: ESRCH means the process doesn't exist.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // No portable liveness probe off unix; assume alive so we never clobber a real instance.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_when_no_lockfile_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let lock = Lock::acquire(path.clone()).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn refuses_when_lockfile_pid_is_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        let err = Lock::acquire(path).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRunning(_)));
    }

    #[test]
    fn recovers_from_stale_lockfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        // PID 999999 is extremely unlikely to be alive in any test environment.
        std::fs::write(&path, "999999").unwrap();
        let lock = Lock::acquire(path.clone()).unwrap();
        let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id());
        lock.release();
    }

    #[test]
    fn drop_without_release_also_removes_the_lockfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        {
            let _lock = Lock::acquire(path.clone()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
