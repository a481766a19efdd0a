//! The localnet node: genesis, boot, readiness, teardown.
//!
//! One [`NodeInstance`] exists per harness run. It owns the per-run temp
//! directory (config, logs) and the node's OS process; `stop()` releases
//! both. The shared instance is created lazily through [`NodeInstance::shared`]
//! so many tests in one process reuse a single node.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tempdir::TempDir;
use tokio::sync::OnceCell;
use url::Url;

use crate::config::HarnessConfig;
use crate::funding::FundingSource;
use crate::keystore::{self, TestAccount};
use crate::lock::{FileStartLock, StartLock, default_lock_path};
use crate::ports::{self, PortSet, allocate_ports};
use crate::process::NodeProcess;
use crate::readiness::{
    DEFAULT_PROBE_INTERVAL, DEFAULT_READY_TIMEOUT, wait_for_port_in_use, wait_for_rpc_ready,
};
use crate::rpc::HttpLedgerClient;

/// Ports the node binds when no remapping is requested.
pub const DEFAULT_RPC_PORT: u16 = 9000;
pub const DEFAULT_AUX_PORT: u16 = 9184;
pub const DEFAULT_FAUCET_PORT: u16 = 5003;

/// Subdirectory of the run's temp root holding the node configuration.
const CONFIG_DIR: &str = "localnet-config";

/// Node log file, relative to the run's temp root.
const LOG_FILE: &str = "logs/localnet.log";

static SHARED: OnceCell<Arc<NodeInstance>> = OnceCell::const_new();

/// A running localnet node and the resources backing it.
#[derive(Debug)]
pub struct NodeInstance {
    rpc_url: Url,
    ports: PortSet,
    config_dir: PathBuf,
    logs_dir: PathBuf,
    process: NodeProcess,
    treasury: Option<TestAccount>,
    faucet_host: Option<String>,
    keep_temp: bool,
    /// Present until `stop()`; holding it keeps the temp root alive.
    temp: std::sync::Mutex<Option<TempDir>>,
    stopped: AtomicBool,
}

impl NodeInstance {
    /// The process-wide shared instance, booted on first use with the
    /// environment-derived configuration.
    pub async fn shared() -> Result<Arc<NodeInstance>> {
        SHARED
            .get_or_try_init(|| async {
                NodeInstance::start(HarnessConfig::from_env()).await.map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Boot a localnet: allocate ports, run genesis, patch the generated
    /// config, start the node under the start lock, and wait until its RPC
    /// answers. On any failure after the temp root exists, the partially
    /// started node is stopped and the temp root removed.
    pub async fn start(config: HarnessConfig) -> Result<NodeInstance> {
        if config.skip {
            anyhow::bail!(
                "localnet execution is disabled ({} is set)",
                crate::config::ENV_SKIP
            );
        }

        let ports = if config.random_ports {
            allocate_ports(config.with_faucet)?
        } else {
            PortSet {
                rpc_port: DEFAULT_RPC_PORT,
                aux_port: DEFAULT_AUX_PORT,
                faucet_port: config.with_faucet.then_some(DEFAULT_FAUCET_PORT),
            }
        };

        let temp = TempDir::new("ledgernet").context("failed to create localnet temp dir")?;
        let temp_root = temp.path().to_path_buf();

        match Self::boot(&config, &ports, &temp_root).await {
            Ok(instance) => {
                tracing::info!(
                    rpc = %instance.rpc_url,
                    root = %temp_root.display(),
                    "Localnet is ready"
                );
                *instance.temp.lock().unwrap_or_else(|e| e.into_inner()) = Some(temp);
                Ok(instance)
            }
            Err(err) => {
                // Aborted start: release the temp root unless asked to keep
                // it for inspection.
                if config.keep_temp {
                    let kept = temp.into_path();
                    tracing::warn!(root = %kept.display(), "Localnet start failed, keeping temp dir");
                } else if let Err(close_err) = temp.close() {
                    tracing::warn!(error = %close_err, "Failed to remove temp dir after aborted start");
                }
                Err(err)
            }
        }
    }

    async fn boot(
        config: &HarnessConfig,
        ports: &PortSet,
        temp_root: &Path,
    ) -> Result<NodeInstance> {
        let config_dir = temp_root.join(CONFIG_DIR);
        let log_path = temp_root.join(LOG_FILE);
        let logs_dir = log_path
            .parent()
            .context("log path has no parent directory")?
            .to_path_buf();
        std::fs::create_dir_all(&config_dir).context("failed to create config directory")?;

        let lock = FileStartLock::new(
            default_lock_path(),
            config.lock_timeout(),
            config.serialize_start,
        );

        // Genesis, spawn and readiness all run under the lock: with default
        // ports, another process may not touch them until ours are bound.
        let process = lock
            .with_lock(|| async {
                run_genesis(&config.node_bin, &config_dir).await?;
                patch_generated_config(&config_dir, ports)?;

                let process = spawn_node(config, ports, &config_dir, &log_path)?;

                let client = HttpLedgerClient::new(rpc_url(ports.rpc_port)?)?;
                let ready = wait_for_rpc_ready(
                    &client,
                    &process,
                    DEFAULT_READY_TIMEOUT,
                    DEFAULT_PROBE_INTERVAL,
                )
                .await;

                let ready = match (ready, ports.faucet_port) {
                    (Ok(()), Some(port)) => {
                        wait_for_port_in_use(
                            port,
                            Some(&process),
                            DEFAULT_READY_TIMEOUT,
                            DEFAULT_PROBE_INTERVAL,
                        )
                        .await
                    }
                    (result, _) => result,
                };

                if let Err(err) = ready {
                    if let Err(stop_err) = process.stop().await {
                        tracing::warn!(error = %stop_err, "Failed to stop node after readiness failure");
                    }
                    return Err(err);
                }
                Ok(process)
            })
            .await?;

        let faucet_host = ports
            .faucet_port
            .map(|port| format!("127.0.0.1:{port}"));

        // With a faucet configured it is the funding source; the treasury
        // scan is skipped so exactly one source is present.
        let treasury = if faucet_host.is_some() {
            None
        } else {
            let client = HttpLedgerClient::new(rpc_url(ports.rpc_port)?)?;
            Some(
                keystore::resolve_treasury_account(&config_dir, &client, config.treasury_index)
                    .await
                    .context("no usable treasury account after genesis")?,
            )
        };

        Ok(NodeInstance {
            rpc_url: rpc_url(ports.rpc_port)?,
            ports: *ports,
            config_dir,
            logs_dir,
            process,
            treasury,
            faucet_host,
            keep_temp: config.keep_temp,
            temp: std::sync::Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// JSON-RPC endpoint of the node.
    pub fn rpc_url(&self) -> &Url {
        &self.rpc_url
    }

    /// Ports the node is serving on.
    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    /// Directory holding the node's generated configuration and keystore.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Directory holding the captured node log.
    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// The pre-funded treasury account, when the treasury path is active.
    pub fn treasury(&self) -> Option<&TestAccount> {
        self.treasury.as_ref()
    }

    /// Host of the faucet sidecar, when one was started.
    pub fn faucet_host(&self) -> Option<&str> {
        self.faucet_host.as_deref()
    }

    /// An RPC client bound to this node.
    pub fn client(&self) -> Result<HttpLedgerClient> {
        HttpLedgerClient::new(self.rpc_url.clone())
    }

    /// The funding source this node offers.
    pub fn funding_source(&self) -> Result<FundingSource> {
        FundingSource::from_node_capabilities(self.treasury.as_ref(), self.faucet_host.as_deref())
    }

    /// Cheap liveness check, raising with diagnostics if the node exited.
    pub async fn ensure_alive(&self) -> Result<()> {
        self.process.ensure_alive().await
    }

    /// Last lines of the node log.
    pub fn log_tail(&self) -> String {
        self.process.log_tail()
    }

    /// The environment name the node reported on startup, grepped from its
    /// log output.
    pub fn active_environment(&self) -> Option<String> {
        introspect_active_environment(&self.log_tail())
    }

    /// Port-bearing lines from the node log, for boot diagnostics.
    pub fn reported_port_lines(&self) -> Vec<String> {
        introspect_port_lines(&self.log_tail())
    }

    /// Stop the node and release the temp root. Idempotent; cleanup
    /// failures are logged rather than raised so they never mask a test
    /// failure.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.process.stop().await?;

        let temp = self
            .temp
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(temp) = temp {
            if self.keep_temp {
                let kept = temp.into_path();
                tracing::info!(root = %kept.display(), "Keeping localnet temp dir");
            } else if let Err(err) = temp.close() {
                tracing::warn!(error = %err, "Failed to remove localnet temp dir");
            }
        }
        Ok(())
    }
}

fn rpc_url(port: u16) -> Result<Url> {
    Url::parse(&format!("http://127.0.0.1:{port}")).context("failed to build node RPC url")
}

/// Run `<node-bin> genesis --working-dir <dir>` to completion.
async fn run_genesis(node_bin: &Path, config_dir: &Path) -> Result<()> {
    tracing::info!(bin = %node_bin.display(), dir = %config_dir.display(), "Running node genesis");

    let output = tokio::process::Command::new(node_bin)
        .arg("genesis")
        .arg("--working-dir")
        .arg(config_dir)
        .output()
        .await
        .context(format!("failed to run {} genesis", node_bin.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "node genesis failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Rewrite the default ports in every generated config file to the
/// allocated ones. A no-op when the defaults are in use.
fn patch_generated_config(config_dir: &Path, ports: &PortSet) -> Result<()> {
    let mut remap = HashMap::new();
    if ports.rpc_port != DEFAULT_RPC_PORT {
        remap.insert(DEFAULT_RPC_PORT, ports.rpc_port);
    }
    if ports.aux_port != DEFAULT_AUX_PORT {
        remap.insert(DEFAULT_AUX_PORT, ports.aux_port);
    }
    if let Some(faucet_port) = ports.faucet_port {
        if faucet_port != DEFAULT_FAUCET_PORT {
            remap.insert(DEFAULT_FAUCET_PORT, faucet_port);
        }
    }
    if remap.is_empty() {
        return Ok(());
    }

    for path in config_files(config_dir)? {
        let text = std::fs::read_to_string(&path)
            .context(format!("failed to read config file {}", path.display()))?;
        let patched = ports::patch_config_text(&text, &remap);
        if patched != text {
            std::fs::write(&path, patched)
                .context(format!("failed to write config file {}", path.display()))?;
            tracing::debug!(file = %path.display(), "Patched ports in config file");
        }
    }
    Ok(())
}

/// YAML config files under `config_dir`, one level of nesting deep.
fn config_files(config_dir: &Path) -> Result<Vec<PathBuf>> {
    fn visit(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in std::fs::read_dir(dir)
            .context(format!("failed to list config dir {}", dir.display()))?
        {
            let path = entry.context("failed to read config dir entry")?.path();
            if path.is_dir() && depth > 0 {
                visit(&path, depth - 1, out)?;
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                out.push(path);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    visit(config_dir, 1, &mut files)?;
    files.sort();
    Ok(files)
}

fn spawn_node(
    config: &HarnessConfig,
    ports: &PortSet,
    config_dir: &Path,
    log_path: &Path,
) -> Result<NodeProcess> {
    let mut args = vec![
        "start".to_string(),
        "--config-dir".to_string(),
        config_dir.display().to_string(),
        "--rpc-port".to_string(),
        ports.rpc_port.to_string(),
        "--aux-port".to_string(),
        ports.aux_port.to_string(),
    ];
    if let Some(faucet_port) = ports.faucet_port {
        args.push("--with-faucet".to_string());
        args.push("--faucet-port".to_string());
        args.push(faucet_port.to_string());
    }

    NodeProcess::spawn(&config.node_bin, &args, &HashMap::new(), log_path)
}

/// Grep the active environment name from node output, e.g.
/// `active environment: localnet`.
fn introspect_active_environment(log: &str) -> Option<String> {
    log.lines().rev().find_map(|line| {
        line.split_once("active environment:")
            .map(|(_, name)| name.trim().to_string())
            .filter(|name| !name.is_empty())
    })
}

/// Lines of node output that mention a port, for boot diagnostics.
fn introspect_port_lines(log: &str) -> Vec<String> {
    log.lines()
        .filter(|line| {
            let lower = line.to_ascii_lowercase();
            lower.contains("port") || lower.contains("listening on")
        })
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_environment_from_log() {
        let log = "booting\nactive environment: localnet\nserving\n";
        assert_eq!(
            introspect_active_environment(log),
            Some("localnet".to_string())
        );
        assert_eq!(introspect_active_environment("no mention here"), None);
    }

    #[test]
    fn test_active_environment_takes_latest() {
        let log = "active environment: stale\nactive environment: fresh\n";
        assert_eq!(
            introspect_active_environment(log),
            Some("fresh".to_string())
        );
    }

    #[test]
    fn test_port_lines_filter() {
        let log = "genesis done\nrpc listening on 127.0.0.1:9000\nfaucet port: 5003\nready\n";
        let lines = introspect_port_lines(log);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("9000"));
    }

    #[test]
    fn test_patch_generated_config_rewrites_defaults() {
        let dir = tempdir::TempDir::new("ledgernet-node-test").unwrap();
        let file = dir.path().join("node.yaml");
        std::fs::write(&file, "rpc-address: 127.0.0.1:9000\nmetrics-port: 9184\n").unwrap();

        let ports = PortSet {
            rpc_port: 40001,
            aux_port: 40002,
            faucet_port: None,
        };
        patch_generated_config(dir.path(), &ports).unwrap();

        let patched = std::fs::read_to_string(&file).unwrap();
        assert!(patched.contains("127.0.0.1:40001"));
        assert!(patched.contains("metrics-port: 40002"));
    }

    #[test]
    fn test_patch_generated_config_noop_on_defaults() {
        let dir = tempdir::TempDir::new("ledgernet-node-test").unwrap();
        let file = dir.path().join("node.yaml");
        let original = "rpc-address: 127.0.0.1:9000\n";
        std::fs::write(&file, original).unwrap();

        let ports = PortSet {
            rpc_port: DEFAULT_RPC_PORT,
            aux_port: DEFAULT_AUX_PORT,
            faucet_port: None,
        };
        patch_generated_config(dir.path(), &ports).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), original);
    }

    #[test]
    fn test_config_files_finds_nested_yaml() {
        let dir = tempdir::TempDir::new("ledgernet-node-test").unwrap();
        std::fs::write(dir.path().join("node.yaml"), "").unwrap();
        std::fs::create_dir(dir.path().join("validators")).unwrap();
        std::fs::write(dir.path().join("validators").join("v0.yml"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let files = config_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
    }
}
