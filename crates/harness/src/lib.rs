//! ledgernet-harness - Ephemeral localnet test harness.
//!
//! This crate boots a disposable single-node ledger service on loopback
//! ports, funds throwaway test accounts against it, and tears everything
//! down afterward, so integration tests can exercise real network behavior
//! without a shared or persistent backend.

pub mod config;
pub mod context;
pub mod env_stack;
pub mod error;
pub mod funding;
pub mod keystore;
pub mod lock;
pub mod manifest;
pub mod node;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod rpc;

pub use config::HarnessConfig;
pub use context::{TestContext, with_context};
pub use env_stack::{EnvOverrideStack, OverrideToken};
pub use error::HarnessError;
pub use funding::{FundingReconciler, FundingReport, FundingRequirement, FundingSource};
pub use keystore::TestAccount;
pub use lock::{FileStartLock, StartLock};
pub use node::NodeInstance;
pub use ports::{PortSet, allocate_ports, patch_config_text};
pub use process::NodeProcess;
pub use rpc::{Address, HttpLedgerClient, LedgerRpcClient};
