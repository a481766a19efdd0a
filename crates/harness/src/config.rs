//! Harness configuration, sourced from environment variables.
//!
//! All knobs are read once into a [`HarnessConfig`] so the rest of the
//! harness never touches `std::env` directly (scoped overrides go through
//! [`crate::env_stack::EnvOverrideStack`] instead).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Skip localnet execution entirely.
pub const ENV_SKIP: &str = "LEDGERNET_SKIP";
/// Keep the per-run temp directory after teardown.
pub const ENV_KEEP_TEMP: &str = "LEDGERNET_KEEP_TEMP";
/// Also start the funding faucet sidecar.
pub const ENV_WITH_FAUCET: &str = "LEDGERNET_WITH_FAUCET";
/// Allocate random loopback ports instead of the node defaults.
pub const ENV_RANDOM_PORTS: &str = "LEDGERNET_RANDOM_PORTS";
/// Explicit keystore index for the treasury account.
pub const ENV_TREASURY_INDEX: &str = "LEDGERNET_TREASURY_INDEX";
/// Override for the start-lock acquisition timeout, in milliseconds.
pub const ENV_LOCK_TIMEOUT_MS: &str = "LEDGERNET_LOCK_TIMEOUT_MS";
/// Path to the node binary.
pub const ENV_NODE_BIN: &str = "LEDGERNET_NODE_BIN";
/// Enable debug logging in the harness.
pub const ENV_DEBUG: &str = "LEDGERNET_DEBUG";
/// Standard CI marker; when set, start serialization defaults on.
pub const ENV_CI: &str = "CI";

/// Default start-lock timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Default node binary name, resolved via PATH.
pub const DEFAULT_NODE_BIN: &str = "ledger-node";

/// Configuration for one harness run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Path to the node binary (`genesis` / `start` subcommands).
    pub node_bin: PathBuf,
    /// Skip localnet execution entirely.
    pub skip: bool,
    /// Keep the per-run temp directory after teardown.
    pub keep_temp: bool,
    /// Start the funding faucet alongside the node.
    pub with_faucet: bool,
    /// Allocate random ports instead of the node defaults.
    pub random_ports: bool,
    /// Explicit keystore index for the treasury account.
    pub treasury_index: Option<usize>,
    /// Start-lock acquisition timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Serialize node startup across processes (defaults on under CI).
    pub serialize_start: bool,
    /// Enable debug logging.
    pub debug: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            node_bin: PathBuf::from(DEFAULT_NODE_BIN),
            skip: false,
            keep_temp: false,
            with_faucet: false,
            random_ports: false,
            treasury_index: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            serialize_start: false,
            debug: false,
        }
    }
}

/// Interpret an environment variable as a boolean flag.
fn flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl HarnessConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        let treasury_index = std::env::var(ENV_TREASURY_INDEX)
            .ok()
            .and_then(|v| v.parse::<usize>().ok());

        let lock_timeout_ms = std::env::var(ENV_LOCK_TIMEOUT_MS)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_LOCK_TIMEOUT.as_millis() as u64);

        let node_bin = std::env::var(ENV_NODE_BIN)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_NODE_BIN));

        Self {
            node_bin,
            skip: flag(ENV_SKIP),
            keep_temp: flag(ENV_KEEP_TEMP),
            with_faucet: flag(ENV_WITH_FAUCET),
            random_ports: flag(ENV_RANDOM_PORTS),
            treasury_index,
            lock_timeout_ms,
            serialize_start: flag(ENV_CI),
            debug: flag(ENV_DEBUG),
        }
    }

    /// Start-lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize harness config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Harness configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert!(!config.skip);
        assert!(!config.with_faucet);
        assert_eq!(config.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.node_bin, PathBuf::from(DEFAULT_NODE_BIN));
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir::TempDir::new("ledgernet-config-test").unwrap();
        let path = dir.path().join("harness.toml");

        let config = HarnessConfig {
            with_faucet: true,
            treasury_index: Some(2),
            lock_timeout_ms: 5_000,
            ..Default::default()
        };

        config.save_to_file(&path).unwrap();
        let loaded = HarnessConfig::load_from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }
}
