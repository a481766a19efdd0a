//! Cross-process start lock.
//!
//! CI runners execute many test processes in parallel on one host; the
//! node's genesis phase contends for well-known resources, so startup is
//! serialized through a marker file holding the owner's pid. Locally (with
//! randomized ports) serialization is disabled and the lock is a no-op.
//!
//! The strategy lives behind [`StartLock`] so it can be swapped for an OS
//! advisory lock or a real distributed lock without touching callers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::error::HarnessError;

/// Mutual exclusion around node startup.
pub trait StartLock {
    /// Acquire the lock, blocking (cooperatively) until it is held or the
    /// acquisition deadline passes.
    fn acquire(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release the lock. Best-effort; failures are logged by callers, not
    /// re-thrown.
    fn release(&self) -> Result<()>;

    /// Run `action` under the lock, always releasing afterwards.
    fn with_lock<F, Fut, T>(&self, action: F) -> impl Future<Output = Result<T>>
    where
        Self: Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        async {
            self.acquire().await?;
            let result = action().await;
            if let Err(err) = self.release() {
                tracing::warn!(error = %err, "Failed to release start lock");
            }
            result
        }
    }
}

/// Poll interval while another process holds the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default marker location, shared by every process on the host.
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("ledgernet-start.lock")
}

/// Filesystem-based [`StartLock`]: an exclusively-created marker file
/// containing the owning pid. A marker whose pid is no longer running is
/// stale and gets reclaimed.
#[derive(Debug, Clone)]
pub struct FileStartLock {
    path: PathBuf,
    timeout: Duration,
    enabled: bool,
}

impl FileStartLock {
    pub fn new(path: PathBuf, timeout: Duration, enabled: bool) -> Self {
        Self {
            path,
            timeout,
            enabled,
        }
    }

    /// The marker path, for diagnostics.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to create the marker exclusively. Returns `Ok(true)` when the
    /// lock was taken, `Ok(false)` when another holder exists.
    fn try_take(&self) -> Result<bool> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                write!(file, "{}", std::process::id())
                    .context("failed to record pid in start lock")?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to create start lock at {}", self.path.display()))),
        }
    }

    /// Pid recorded in the current marker, if readable.
    fn holder_pid(&self) -> Option<i32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
    }

    /// Delete a marker left behind by a dead process.
    fn reclaim_stale(&self) -> bool {
        let Some(pid) = self.holder_pid() else {
            // Unreadable marker: likely mid-write by a live owner.
            return false;
        };
        if pid_is_alive(pid) {
            return false;
        }
        tracing::info!(pid, path = %self.path.display(), "Reclaiming stale start lock");
        std::fs::remove_file(&self.path).is_ok()
    }
}

impl StartLock for FileStartLock {
    async fn acquire(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let start = Instant::now();
        loop {
            if self.try_take()? {
                tracing::debug!(path = %self.path.display(), "Start lock acquired");
                return Ok(());
            }

            if self.reclaim_stale() {
                continue;
            }

            if start.elapsed() > self.timeout {
                return Err(HarnessError::LockTimeout {
                    path: self.path.clone(),
                    timeout: self.timeout,
                }
                .into());
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn release(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        std::fs::remove_file(&self.path)
            .context(format!("failed to remove start lock at {}", self.path.display()))
    }
}

/// Check whether a process with the given pid is running.
#[cfg(unix)]
pub fn pid_is_alive(pid: i32) -> bool {
    // Signal 0 performs the permission/existence check without delivering
    // anything. EPERM still means the process exists.
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a liveness probe, treat every holder as alive and let the
/// acquisition timeout handle abandoned markers.
#[cfg(not(unix))]
pub fn pid_is_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &tempdir::TempDir, timeout: Duration) -> FileStartLock {
        FileStartLock::new(dir.path().join("start.lock"), timeout, true)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempdir::TempDir::new("ledgernet-lock-test").unwrap();
        let lock = lock_in(&dir, Duration::from_secs(5));

        lock.acquire().await.unwrap();
        assert!(lock.path().exists());
        let recorded = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());

        lock.release().unwrap();
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn test_disabled_lock_is_noop() {
        let dir = tempdir::TempDir::new("ledgernet-lock-test").unwrap();
        let lock = FileStartLock::new(dir.path().join("start.lock"), Duration::from_secs(5), false);

        lock.acquire().await.unwrap();
        assert!(!lock.path().exists());
        lock.release().unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let dir = tempdir::TempDir::new("ledgernet-lock-test").unwrap();
        let lock = lock_in(&dir, Duration::from_secs(5));

        // A pid beyond the kernel's default pid_max cannot be running.
        std::fs::write(lock.path(), i32::MAX.to_string()).unwrap();

        let start = Instant::now();
        lock.acquire().await.unwrap();
        // Reclaim must not wait out the poll timeout.
        assert!(start.elapsed() < Duration::from_secs(2));
        lock.release().unwrap();
    }

    #[tokio::test]
    async fn test_live_holder_times_out() {
        let dir = tempdir::TempDir::new("ledgernet-lock-test").unwrap();
        let lock = lock_in(&dir, Duration::from_millis(400));

        // Our own pid is definitely alive.
        std::fs::write(lock.path(), std::process::id().to_string()).unwrap();

        let err = lock.acquire().await.unwrap_err();
        let lock_err = err.downcast_ref::<HarnessError>().unwrap();
        match lock_err {
            HarnessError::LockTimeout { path, .. } => {
                assert_eq!(path, &lock.path().to_path_buf());
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let dir = tempdir::TempDir::new("ledgernet-lock-test").unwrap();
        let lock = lock_in(&dir, Duration::from_secs(5));

        let result: Result<()> = lock
            .with_lock(|| async { anyhow::bail!("action failed") })
            .await;
        assert!(result.is_err());
        assert!(!lock.path().exists());
    }
}
