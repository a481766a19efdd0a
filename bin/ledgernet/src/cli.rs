use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "ledgernet", about = "Boot a disposable single-node ledger localnet")]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "LEDGERNET_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the node binary.
    #[arg(long, env = "LEDGERNET_NODE_BIN")]
    pub node_bin: Option<PathBuf>,

    /// Also start the funding faucet sidecar.
    #[arg(long, env = "LEDGERNET_WITH_FAUCET", default_value_t = false)]
    pub with_faucet: bool,

    /// Allocate random loopback ports instead of the node defaults.
    #[arg(long, env = "LEDGERNET_RANDOM_PORTS", default_value_t = false)]
    pub random_ports: bool,

    /// Keep the temp directory (config, logs) after shutdown.
    #[arg(long, env = "LEDGERNET_KEEP_TEMP", default_value_t = false)]
    pub keep_temp: bool,

    /// Explicit keystore index for the treasury account.
    #[arg(long, env = "LEDGERNET_TREASURY_INDEX")]
    pub treasury_index: Option<usize>,

    /// Load the harness configuration from a TOML file instead of flags.
    #[arg(long, alias = "conf", env = "LEDGERNET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Save the effective configuration to this path before booting.
    #[arg(long, env = "LEDGERNET_SAVE_CONFIG")]
    pub save_config: Option<PathBuf>,
}
