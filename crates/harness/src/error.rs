//! Error taxonomy for the localnet harness.
//!
//! Everything here is raised to the immediate caller; teardown paths log
//! failures instead of re-throwing so a test failure is never masked by a
//! cleanup failure.

use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by the harness core.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The OS refused loopback networking (EPERM/EACCES). Callers may want
    /// to skip the whole suite instead of failing it.
    #[error("environment blocks local networking ({0}); consider skipping localnet tests")]
    EnvironmentBlocked(#[source] std::io::Error),

    /// The node process exited before (or while) it was being used.
    #[error("node process exited unexpectedly (code: {code:?}, signal: {signal:?})\n--- log tail ---\n{log_tail}")]
    Crash {
        code: Option<i32>,
        signal: Option<i32>,
        log_tail: String,
    },

    /// A bounded polling loop ran out of time.
    #[error("timed out after {elapsed:?} waiting for {what} (last error: {last_error})\n--- log tail ---\n{log_tail}")]
    Timeout {
        what: String,
        elapsed: Duration,
        last_error: String,
        log_tail: String,
    },

    /// All funding rounds failed.
    #[error("funding exhausted after {rounds} rounds: {last_error}")]
    FundingExhausted { rounds: u32, last_error: String },

    /// The start lock could not be acquired in time. The path is named so
    /// an operator can inspect or remove the marker manually.
    #[error("could not acquire start lock at {path} within {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// Invalid or incomplete harness configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A requested keystore entry or address was not found. Lists what was
    /// scanned as a remediation hint.
    #[error("keystore entry '{requested}' not found; scanned candidates: [{}]", available.join(", "))]
    KeystoreEntryNotFound {
        requested: String,
        available: Vec<String>,
    },
}

impl HarnessError {
    /// Classify a bind failure: permission errors mean the sandbox or OS
    /// policy blocks loopback networking, everything else is a plain I/O
    /// error.
    pub fn from_bind_error(err: std::io::Error) -> anyhow::Error {
        if matches!(err.kind(), std::io::ErrorKind::PermissionDenied) {
            HarnessError::EnvironmentBlocked(err).into()
        } else {
            anyhow::Error::new(err).context("failed to bind loopback port")
        }
    }

    /// True when the error (or its root cause) is [`HarnessError::EnvironmentBlocked`].
    pub fn is_environment_blocked(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<HarnessError>(),
                Some(HarnessError::EnvironmentBlocked(_))
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_classification() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "EPERM");
        let err = HarnessError::from_bind_error(denied);
        assert!(HarnessError::is_environment_blocked(&err));

        let other = std::io::Error::new(std::io::ErrorKind::AddrInUse, "EADDRINUSE");
        let err = HarnessError::from_bind_error(other);
        assert!(!HarnessError::is_environment_blocked(&err));
    }

    #[test]
    fn test_keystore_error_lists_candidates() {
        let err = HarnessError::KeystoreEntryNotFound {
            requested: "treasury".to_string(),
            available: vec!["0xaa (balance: 0)".to_string(), "0xbb (balance: 0)".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("0xaa"));
        assert!(msg.contains("0xbb"));
    }
}
