//! Per-test orchestration: one [`TestContext`] per test, sharing the
//! process-wide node.
//!
//! A context owns a dedicated temp directory with a clean copy of the
//! test's build sources, and routes account creation, funding and
//! transaction submission through the shared node. `cleanup()` is
//! idempotent and is guaranteed to run when the context is used through
//! [`with_context`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tempdir::TempDir;

use crate::error::HarnessError;
use crate::funding::{FundingReconciler, FundingReport, FundingRequirement, FundingSource};
use crate::keystore::{self, TestAccount};
use crate::node::NodeInstance;
use crate::rpc::{
    Address, LedgerRpcClient, TransactionKind, TransactionRequest, TransactionResponse,
};

/// Subdirectories never carried into a context's sources copy. Each test
/// builds from scratch; stale outputs from a prior run must not leak in.
const BUILD_OUTPUT_DIRS: &[&str] = &["artifacts", "build", "target"];

/// Where `build` places compiled module files inside the context root.
const ARTIFACTS_DIR: &str = "artifacts";

/// Deadline for one finality wait.
const FINALITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for finality polling.
const FINALITY_INTERVAL: Duration = Duration::from_millis(500);

/// A per-test handle over the shared localnet.
pub struct TestContext<C> {
    test_id: String,
    node: Arc<NodeInstance>,
    client: C,
    source: FundingSource,
    sources_dir: Option<PathBuf>,
    temp: std::sync::Mutex<Option<TempDir>>,
}

impl TestContext<crate::rpc::HttpLedgerClient> {
    /// Context against the shared node, with an HTTP client bound to it.
    pub async fn new(test_id: &str, build_sources: Option<&Path>) -> Result<Self> {
        let node = NodeInstance::shared().await?;
        let client = node.client()?;
        Self::with_client(test_id, build_sources, node, client)
    }
}

impl<C: LedgerRpcClient> TestContext<C> {
    /// Context with an explicit client, letting tests substitute an
    /// in-memory ledger.
    pub fn with_client(
        test_id: &str,
        build_sources: Option<&Path>,
        node: Arc<NodeInstance>,
        client: C,
    ) -> Result<Self> {
        let source = node.funding_source()?;
        let temp = TempDir::new(&format!("ledgernet-ctx-{test_id}"))
            .context("failed to create test context temp dir")?;

        let sources_dir = match build_sources {
            Some(sources) => {
                let dest = temp.path().join("sources");
                copy_sources(sources, &dest)?;
                Some(dest)
            }
            None => None,
        };

        tracing::debug!(test_id, root = %temp.path().display(), "Test context created");

        Ok(Self {
            test_id: test_id.to_string(),
            node,
            client,
            source,
            sources_dir,
            temp: std::sync::Mutex::new(Some(temp)),
        })
    }

    /// The shared node this context runs against.
    pub fn node(&self) -> &NodeInstance {
        &self.node
    }

    /// The context's private copy of the build sources, if any.
    pub fn sources_dir(&self) -> Option<&Path> {
        self.sources_dir.as_deref()
    }

    /// Root of the context's temp directory, until `cleanup()`.
    pub fn root(&self) -> Option<PathBuf> {
        self.temp
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.path().to_path_buf())
    }

    /// Derive a fresh account for this test and register its key with the
    /// node so locally-signed submissions work. Deterministic per
    /// `(test_id, label)`.
    pub fn create_account(&self, label: &str) -> Result<TestAccount> {
        let account = TestAccount::derive(&self.test_id, label);
        keystore::register_account(self.node.config_dir(), &account)?;
        Ok(account)
    }

    /// Bring `address` up to `requirement` using the node's funding
    /// source. Already-funded accounts return a zero-activity report.
    pub async fn fund_account(
        &self,
        address: &Address,
        requirement: &FundingRequirement,
    ) -> Result<FundingReport> {
        FundingReconciler::new(&self.client, self.source.clone())
            .fund(address, requirement)
            .await
    }

    /// Compile the context's sources copy into `artifacts/` via the node
    /// binary's build subcommand.
    pub async fn build(&self) -> Result<PathBuf> {
        let sources = self
            .sources_dir
            .as_ref()
            .ok_or_else(|| {
                HarnessError::Configuration(
                    "this context was created without build sources".to_string(),
                )
            })?;
        let artifacts = self
            .root()
            .ok_or_else(|| {
                HarnessError::Configuration("context already cleaned up".to_string())
            })?
            .join(ARTIFACTS_DIR);
        std::fs::create_dir_all(&artifacts).context("failed to create artifacts dir")?;

        let node_bin = crate::config::HarnessConfig::from_env().node_bin;
        let config_dir = self.node.config_dir().display().to_string();

        // The build tool locates the active localnet through the
        // environment; scope the override so concurrent contexts do not
        // clobber each other.
        let output = crate::env_stack::shared()
            .with_env(&[("LEDGER_CONFIG_DIR", config_dir.as_str())], || async {
                tokio::process::Command::new(&node_bin)
                    .arg("build")
                    .arg("--path")
                    .arg(sources)
                    .arg("--out")
                    .arg(&artifacts)
                    .output()
                    .await
            })
            .await
            .context(format!("failed to run {} build", node_bin.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "package build failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        tracing::debug!(out = %artifacts.display(), "Package built");
        Ok(artifacts)
    }

    /// Publish the built modules from `artifacts/` as `sender` and wait
    /// for the publish transaction to finalize.
    pub async fn publish(&self, sender: &TestAccount) -> Result<TransactionResponse> {
        let artifacts = self
            .root()
            .ok_or_else(|| {
                HarnessError::Configuration("context already cleaned up".to_string())
            })?
            .join(ARTIFACTS_DIR);

        let modules = read_modules(&artifacts)?;
        if modules.is_empty() {
            anyhow::bail!(
                "no compiled modules found in {}; run build first",
                artifacts.display()
            );
        }

        let response = self
            .execute(TransactionRequest {
                sender: sender.address.clone(),
                kind: TransactionKind::Publish { modules },
            })
            .await?;
        self.wait_for_finality(&response.digest).await
    }

    /// Submit a transaction and return its execution result.
    pub async fn execute(&self, request: TransactionRequest) -> Result<TransactionResponse> {
        self.node.ensure_alive().await?;
        self.client.execute_transaction(&request).await
    }

    /// Poll until the transaction is visible and executed, or the
    /// finality deadline passes.
    pub async fn wait_for_finality(&self, digest: &str) -> Result<TransactionResponse> {
        let start = Instant::now();
        let mut last_error = "transaction not yet queried".to_string();

        loop {
            match self.client.get_transaction(digest).await {
                Ok(response) if response.success => return Ok(response),
                Ok(response) => {
                    if let Some(error) = response.error {
                        anyhow::bail!("transaction {} failed: {}", digest, error);
                    }
                    last_error = format!("transaction {} not yet executed", digest);
                }
                Err(err) => last_error = err.to_string(),
            }

            if start.elapsed() > FINALITY_TIMEOUT {
                return Err(HarnessError::Timeout {
                    what: format!("finality of transaction {}", digest),
                    elapsed: start.elapsed(),
                    last_error,
                    log_tail: self.node.log_tail(),
                }
                .into());
            }

            tokio::time::sleep(FINALITY_INTERVAL).await;
        }
    }

    /// Remove the context's temp directory. Idempotent; removal failures
    /// are logged, never raised, so they cannot mask a test failure.
    pub fn cleanup(&self) {
        let temp = self
            .temp
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(temp) = temp {
            let root = temp.path().to_path_buf();
            if let Err(err) = temp.close() {
                tracing::warn!(root = %root.display(), error = %err, "Failed to remove context temp dir");
            } else {
                tracing::debug!(root = %root.display(), "Test context cleaned up");
            }
        }
    }
}

/// Run `action` with a context, cleaning up on every exit path.
pub async fn with_context<C, F, Fut, T>(context: TestContext<C>, action: F) -> Result<T>
where
    C: LedgerRpcClient,
    F: FnOnce(Arc<TestContext<C>>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let context = Arc::new(context);
    let result = action(context.clone()).await;
    context.cleanup();
    result
}

/// Copy a source tree, skipping build-output subdirectories at any depth.
fn copy_sources(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)
        .context(format!("failed to create sources copy at {}", to.display()))?;

    for entry in std::fs::read_dir(from)
        .context(format!("failed to read sources at {}", from.display()))?
    {
        let entry = entry.context("failed to read sources entry")?;
        let name = entry.file_name();
        let src = entry.path();
        let dst = to.join(&name);

        if src.is_dir() {
            if BUILD_OUTPUT_DIRS
                .iter()
                .any(|skip| name.to_str() == Some(skip))
            {
                continue;
            }
            copy_sources(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst)
                .context(format!("failed to copy {}", src.display()))?;
        }
    }
    Ok(())
}

/// Read compiled modules (base64, one per file) from the artifacts dir.
fn read_modules(artifacts: &Path) -> Result<Vec<String>> {
    let mut modules = Vec::new();
    let entries = std::fs::read_dir(artifacts)
        .context(format!("failed to read artifacts at {}", artifacts.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .context("failed to list artifacts")?;
    paths.sort();

    for path in paths {
        if !path.is_file() {
            continue;
        }
        let bytes = std::fs::read(&path)
            .context(format!("failed to read module {}", path.display()))?;
        modules.push(BASE64.encode(bytes));
    }
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_sources_strips_build_outputs() {
        let src = tempdir::TempDir::new("ledgernet-ctx-src").unwrap();
        std::fs::write(src.path().join("module.txt"), "code").unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("nested").join("inner.txt"), "more").unwrap();
        for dir in BUILD_OUTPUT_DIRS {
            std::fs::create_dir(src.path().join(dir)).unwrap();
            std::fs::write(src.path().join(dir).join("stale.bin"), "old").unwrap();
        }

        let dst = tempdir::TempDir::new("ledgernet-ctx-dst").unwrap();
        let dest = dst.path().join("sources");
        copy_sources(src.path(), &dest).unwrap();

        assert!(dest.join("module.txt").exists());
        assert!(dest.join("nested").join("inner.txt").exists());
        for dir in BUILD_OUTPUT_DIRS {
            assert!(!dest.join(dir).exists());
        }
    }

    #[test]
    fn test_read_modules_encodes_sorted() {
        let dir = tempdir::TempDir::new("ledgernet-ctx-art").unwrap();
        std::fs::write(dir.path().join("b.mv"), b"second").unwrap();
        std::fs::write(dir.path().join("a.mv"), b"first").unwrap();

        let modules = read_modules(dir.path()).unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0], BASE64.encode(b"first"));
        assert_eq!(modules[1], BASE64.encode(b"second"));
    }
}
