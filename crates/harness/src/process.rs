//! Lifecycle management for the node OS process.
//!
//! Owns the child across its run: spawn with stdio appended to a log file,
//! cheap liveness checks during polling, and graceful stop (SIGTERM, grace
//! window, SIGKILL).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

use crate::error::HarnessError;

/// Grace window between SIGTERM and SIGKILL on stop.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Number of log lines attached to crash and timeout diagnostics.
pub const LOG_TAIL_LINES: usize = 40;

#[derive(Debug)]
struct Inner {
    child: Option<Child>,
    /// Recorded once the child is observed to have exited.
    exit: Option<ExitStatus>,
}

/// A spawned node process and its log file.
#[derive(Debug)]
pub struct NodeProcess {
    inner: tokio::sync::Mutex<Inner>,
    log_path: PathBuf,
    pid: u32,
}

impl NodeProcess {
    /// Spawn `bin` with `args`, redirecting stdout and stderr into an
    /// append-mode log file at `log_path`.
    pub fn spawn(
        bin: &Path,
        args: &[String],
        env: &HashMap<String, String>,
        log_path: &Path,
    ) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create log directory")?;
        }

        let stdout_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .context(format!("failed to open log file at {}", log_path.display()))?;
        let stderr_log = stdout_log
            .try_clone()
            .context("failed to clone log file handle")?;

        let child = Command::new(bin)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true)
            .spawn()
            .context(format!("failed to spawn {}", bin.display()))?;

        let pid = child
            .id()
            .context("spawned process has no pid")?;

        tracing::info!(bin = %bin.display(), pid, log = %log_path.display(), "Node process started");

        Ok(Self {
            inner: tokio::sync::Mutex::new(Inner {
                child: Some(child),
                exit: None,
            }),
            log_path: log_path.to_path_buf(),
            pid,
        })
    }

    /// OS pid of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Path of the captured log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Non-blocking liveness check. Returns a [`HarnessError::Crash`] with
    /// the exit code/signal and a log tail if the process has exited.
    pub async fn ensure_alive(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.exit.is_none() {
            if let Some(child) = inner.child.as_mut() {
                if let Some(status) = child
                    .try_wait()
                    .context("failed to poll node process status")?
                {
                    inner.exit = Some(status);
                }
            }
        }

        match inner.exit {
            None => Ok(()),
            Some(status) => Err(self.crash_error(status).into()),
        }
    }

    /// Stop the process: SIGTERM, wait up to [`STOP_GRACE`], SIGKILL on
    /// expiry. Stopping an already-stopped process is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.child.take() else {
            return Ok(());
        };

        if inner.exit.is_some() || matches!(child.try_wait(), Ok(Some(_))) {
            tracing::debug!(pid = self.pid, "Node process already exited");
            return Ok(());
        }

        terminate_gracefully(self.pid);

        let status = match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => status.context("failed to wait for node process")?,
            Err(_) => {
                tracing::warn!(pid = self.pid, grace = ?STOP_GRACE, "Node ignored SIGTERM, killing");
                child
                    .start_kill()
                    .context("failed to kill node process")?;
                child.wait().await.context("failed to reap node process")?
            }
        };

        inner.exit = Some(status);
        tracing::info!(pid = self.pid, %status, "Node process stopped");
        Ok(())
    }

    /// Last [`LOG_TAIL_LINES`] lines of the captured log, for diagnostics.
    pub fn log_tail(&self) -> String {
        log_tail(&self.log_path, LOG_TAIL_LINES)
    }

    fn crash_error(&self, status: ExitStatus) -> HarnessError {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        HarnessError::Crash {
            code: status.code(),
            signal,
            log_tail: self.log_tail(),
        }
    }
}

/// Send SIGTERM to a pid. ESRCH (already gone) is not an error here; the
/// subsequent `wait` observes the exit either way.
#[cfg(unix)]
fn terminate_gracefully(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if err != nix::Error::ESRCH {
            tracing::warn!(pid, error = %err, "Failed to SIGTERM node process");
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_pid: u32) {}

/// Read the last `lines` lines of a log file. Missing or unreadable logs
/// yield a placeholder rather than an error: this runs on failure paths.
pub fn log_tail(path: &Path, lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(_) => format!("<no log captured at {}>", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_shell(script: &str, log: &Path) -> NodeProcess {
        NodeProcess::spawn(
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
            log,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_alive_reports_exit_code() {
        let dir = tempdir::TempDir::new("ledgernet-proc-test").unwrap();
        let log = dir.path().join("node.log");
        let process = spawn_shell("echo failing; exit 3", &log);

        // Give the shell time to run and exit.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = process.ensure_alive().await.unwrap_err();
        match err.downcast_ref::<HarnessError>().unwrap() {
            HarnessError::Crash { code, log_tail, .. } => {
                assert_eq!(*code, Some(3));
                assert!(log_tail.contains("failing"));
            }
            other => panic!("expected Crash, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempdir::TempDir::new("ledgernet-proc-test").unwrap();
        let log = dir.path().join("node.log");
        let process = spawn_shell("sleep 30", &log);

        process.ensure_alive().await.unwrap();
        process.stop().await.unwrap();
        // Second stop is a no-op.
        process.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_after_exit_is_noop() {
        let dir = tempdir::TempDir::new("ledgernet-proc-test").unwrap();
        let log = dir.path().join("node.log");
        let process = spawn_shell("exit 0", &log);

        tokio::time::sleep(Duration::from_millis(300)).await;
        process.stop().await.unwrap();
    }

    #[test]
    fn test_log_tail_truncates() {
        let dir = tempdir::TempDir::new("ledgernet-proc-test").unwrap();
        let log = dir.path().join("node.log");
        let content: Vec<String> = (0..100).map(|i| format!("line-{i}")).collect();
        std::fs::write(&log, content.join("\n")).unwrap();

        let tail = log_tail(&log, 10);
        assert!(tail.starts_with("line-90"));
        assert!(tail.ends_with("line-99"));
    }

    #[test]
    fn test_log_tail_missing_file() {
        let tail = log_tail(Path::new("/nonexistent/node.log"), 10);
        assert!(tail.contains("no log captured"));
    }
}
