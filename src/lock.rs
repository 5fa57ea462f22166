// src/lock.rs

//! Repository lock
//!
//! A marker directory under the state directory brackets every mutating
//! operation. The directory is created atomically and holds a `pid` file
//! naming its owner. Within one process the lock is reentrant: nested
//! acquisitions only bump a counter, and the marker goes away when the
//! counter returns to zero.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Locks older than this are considered abandoned whether or not the
/// recorded process is alive
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(2 * 60 * 60);

const PID_FILE: &str = "pid";
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug)]
pub struct RepositoryLock {
    dir: PathBuf,
    force: bool,
    stale_after: Duration,
    depth: Cell<usize>,
}

impl RepositoryLock {
    /// `force` removes an existing lock unconditionally
    pub fn new(dir: impl Into<PathBuf>, force: bool) -> Self {
        Self {
            dir: dir.into(),
            force,
            stale_after: STALE_LOCK_AGE,
            depth: Cell::new(0),
        }
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn is_locked(&self) -> bool {
        self.depth.get() > 0
    }

    /// Acquire the lock, returning a guard that releases it on drop
    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        self.lock()?;
        Ok(LockGuard { lock: self })
    }

    pub fn lock(&self) -> Result<()> {
        if self.is_locked() {
            self.depth.set(self.depth.get() + 1);
            debug!("Re-entered lock {} (depth {})", self.dir.display(), self.depth.get());
            return Ok(());
        }

        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..MAX_ATTEMPTS {
            match fs::create_dir(&self.dir) {
                Ok(()) => {
                    mark_owner(&self.dir, std::process::id())?;
                    self.depth.set(1);
                    debug!("Acquired lock {}", self.dir.display());
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let pid = self.owner();
                    if !self.may_reclaim(pid) {
                        return Err(Error::LockContention {
                            pid,
                            path: self.dir.clone(),
                        });
                    }
                    match fs::remove_dir_all(&self.dir) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::LockContention {
            pid: self.owner(),
            path: self.dir.clone(),
        })
    }

    pub fn unlock(&self) -> Result<()> {
        let depth = self.depth.get();
        if depth == 0 {
            warn!("Unlock of {} requested while not locked", self.dir.display());
            return Ok(());
        }

        self.depth.set(depth - 1);
        if depth > 1 {
            return Ok(());
        }

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                debug!("Released lock {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Lock {} vanished while held", self.dir.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn owner(&self) -> Option<i32> {
        fs::read_to_string(self.dir.join(PID_FILE))
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    fn age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.dir).and_then(|m| m.modified()).ok()?;
        Utc::now()
            .signed_duration_since(DateTime::<Utc>::from(modified))
            .to_std()
            .ok()
    }

    fn may_reclaim(&self, pid: Option<i32>) -> bool {
        if self.force {
            warn!("Forcibly removing lock {}", self.dir.display());
            return true;
        }

        if self.age().is_some_and(|age| age >= self.stale_after) {
            warn!(
                "Removing lock {} older than {} minutes",
                self.dir.display(),
                self.stale_after.as_secs() / 60
            );
            return true;
        }

        match pid {
            Some(pid) if !process_alive(pid) => {
                debug!("Removing stale lock {} left by pid {}", self.dir.display(), pid);
                true
            }
            _ => false,
        }
    }
}

/// Releases one level of the lock when dropped
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a RepositoryLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            warn!("Failed to release lock {}: {}", self.lock.dir.display(), e);
        }
    }
}

/// Record `pid` as owner of a freshly created marker; the marker is
/// removed again if that fails
fn mark_owner(dir: &Path, pid: u32) -> Result<()> {
    if let Err(e) = fs::write(dir.join(PID_FILE), pid.to_string()) {
        if let Err(cleanup) = fs::remove_dir_all(dir) {
            warn!("Failed to remove lock {}: {}", dir.display(), cleanup);
        }
        return Err(Error::IoError(format!(
            "Failed to record lock owner in {}: {}",
            dir.display(),
            e
        )));
    }
    Ok(())
}

/// Only "no such process" counts as dead; permission errors and the like
/// leave the owner presumed alive
#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return true;
    }
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Above any kernel's pid_max
    const DEAD_PID: i32 = i32::MAX - 1;

    fn seed_lock(dir: &Path, pid: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(PID_FILE), pid).unwrap();
    }

    #[test]
    fn test_marker_is_removed_when_owner_cannot_be_recorded() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");
        // A directory where the pid file belongs makes the write fail
        fs::create_dir_all(dir.join(PID_FILE)).unwrap();

        let err = mark_owner(&dir, std::process::id()).unwrap_err();
        assert!(matches!(err, Error::IoError(_)), "got {}", err);
        assert!(!dir.exists());
    }

    #[test]
    fn test_lock_is_reentrant() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");
        let lock = RepositoryLock::new(&dir, false);

        lock.lock().unwrap();
        lock.lock().unwrap();
        assert!(dir.exists());
        let pid = fs::read_to_string(dir.join(PID_FILE)).unwrap();
        assert_eq!(pid, std::process::id().to_string());

        lock.unlock().unwrap();
        assert!(dir.exists());
        assert!(lock.is_locked());

        lock.unlock().unwrap();
        assert!(!dir.exists());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_unlock_while_unlocked_is_harmless() {
        let temp = TempDir::new().unwrap();
        let lock = RepositoryLock::new(temp.path().join("lock"), false);
        assert!(lock.unlock().is_ok());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");
        let lock = RepositoryLock::new(&dir, false);
        {
            let _outer = lock.acquire().unwrap();
            {
                let _inner = lock.acquire().unwrap();
            }
            assert!(dir.exists());
        }
        assert!(!dir.exists());
    }

    #[test]
    fn test_dead_owner_reclaimed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");
        seed_lock(&dir, &DEAD_PID.to_string());

        let lock = RepositoryLock::new(&dir, false);
        lock.lock().unwrap();
        let pid = fs::read_to_string(dir.join(PID_FILE)).unwrap();
        assert_eq!(pid, std::process::id().to_string());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_live_owner_contends() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");

        let holder = RepositoryLock::new(&dir, false);
        holder.lock().unwrap();

        let other = RepositoryLock::new(&dir, false);
        let err = other.lock().unwrap_err();
        match err {
            Error::LockContention { pid, path } => {
                assert_eq!(pid, Some(std::process::id() as i32));
                assert_eq!(path, dir);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(dir.exists());
        holder.unlock().unwrap();
    }

    #[test]
    fn test_unreadable_owner_contends() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");
        seed_lock(&dir, "garbage");

        let err = RepositoryLock::new(&dir, false).lock().unwrap_err();
        assert!(matches!(err, Error::LockContention { pid: None, .. }));
    }

    #[test]
    fn test_force_removes_live_lock() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");
        seed_lock(&dir, &std::process::id().to_string());

        let lock = RepositoryLock::new(&dir, true);
        lock.lock().unwrap();
        assert!(lock.is_locked());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_old_lock_reclaimed_even_if_owner_alive() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lock");
        seed_lock(&dir, &std::process::id().to_string());

        let lock = RepositoryLock::new(&dir, false).with_stale_after(Duration::ZERO);
        lock.lock().unwrap();
        lock.unlock().unwrap();
        assert!(!dir.exists());
    }
}
