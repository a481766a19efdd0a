//! Readiness probing: turn "process spawned" into "service usable".
//!
//! Two independent probes: an RPC liveness check for the node itself, and
//! a plain port-in-use check for sidecars that expose no RPC contract.
//! Every iteration checks the tracked process first so a crash fails the
//! wait immediately instead of burning the whole timeout.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::HarnessError;
use crate::process::NodeProcess;
use crate::rpc::LedgerRpcClient;

/// Default interval between readiness probe attempts.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Default overall readiness deadline.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll a cheap read-only RPC until the node answers, the deadline
/// passes, or the process crashes.
pub async fn wait_for_rpc_ready<C: LedgerRpcClient>(
    client: &C,
    process: &NodeProcess,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut last_error = "rpc not yet probed".to_string();

    loop {
        // Fail fast on a crashed process; a Crash error is more useful
        // than a timeout with no cause.
        process.ensure_alive().await?;

        match client.get_latest_checkpoint().await {
            Ok(seq) => {
                tracing::debug!(checkpoint = seq, elapsed = ?start.elapsed(), "Node RPC is ready");
                return Ok(());
            }
            Err(err) => {
                last_error = err.to_string();
                tracing::trace!(error = %last_error, "Readiness probe failed, retrying...");
            }
        }

        if start.elapsed() > timeout {
            return Err(HarnessError::Timeout {
                what: "node RPC readiness".to_string(),
                elapsed: start.elapsed(),
                last_error,
                log_tail: process.log_tail(),
            }
            .into());
        }

        tokio::time::sleep(interval).await;
    }
}

/// Wait until something is listening on a loopback port. Used for sidecar
/// services (e.g. the faucet) that only expose a socket.
pub async fn wait_for_port_in_use(
    port: u16,
    process: Option<&NodeProcess>,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut last_error = "port not yet probed".to_string();

    loop {
        if let Some(process) = process {
            process.ensure_alive().await?;
        }

        match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            Ok(_) => {
                tracing::debug!(port, elapsed = ?start.elapsed(), "Port is in use");
                return Ok(());
            }
            Err(err) => {
                last_error = err.to_string();
            }
        }

        if start.elapsed() > timeout {
            return Err(HarnessError::Timeout {
                what: format!("port {} to be in use", port),
                elapsed: start.elapsed(),
                last_error,
                log_tail: process
                    .map(|p| p.log_tail())
                    .unwrap_or_else(|| "<no process tracked>".to_string()),
            }
            .into());
        }

        tokio::time::sleep(interval).await;
    }
}
