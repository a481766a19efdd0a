//! ledgernet is a CLI tool to boot a disposable single-node ledger
//! localnet for manual poking: it starts the node, prints the endpoints,
//! and tears everything down on Ctrl-C.

mod cli;

use anyhow::Result;
use clap::Parser;

use cli::Cli;
use ledgernet_harness::{HarnessConfig, NodeInstance};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    // If a config file is provided, it wins over individual flags.
    let mut config = if let Some(config_path) = &cli.config {
        tracing::info!(config_path = %config_path.display(), "Loading harness config from file...");
        HarnessConfig::load_from_file(config_path)?
    } else {
        let mut config = HarnessConfig::from_env();
        config.with_faucet |= cli.with_faucet;
        config.random_ports |= cli.random_ports;
        config.keep_temp |= cli.keep_temp;
        if cli.treasury_index.is_some() {
            config.treasury_index = cli.treasury_index;
        }
        config
    };
    if let Some(node_bin) = cli.node_bin {
        config.node_bin = node_bin;
    }

    if let Some(save_path) = &cli.save_config {
        config.save_to_file(save_path)?;
    }

    let node = NodeInstance::start(config).await?;

    tracing::info!(rpc = %node.rpc_url(), "Localnet is up");
    if let Some(host) = node.faucet_host() {
        tracing::info!(faucet = host, "Faucet is up");
    }
    if let Some(treasury) = node.treasury() {
        tracing::info!(address = %treasury.address, "Treasury account");
    }
    if let Some(environment) = node.active_environment() {
        tracing::info!(environment = %environment, "Active environment");
    }

    tracing::info!("Press Ctrl-C to shut down");
    tokio::signal::ctrl_c().await?;

    node.stop().await?;
    Ok(())
}
