use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use node::config::NodeConfig;
use node::logging::init_logging;
use node::simulation::{build_chain, store_from_chain, sync_over_service};
use node::storage::BlockStore;
use chainsync_core::BlockDifficulty;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Work of every block in a simulated chain
const SIMULATED_DIFFICULTY: BlockDifficulty = BlockDifficulty(10);

#[derive(Parser)]
#[command(name = "chainsync-node")]
#[command(about = "Header-first block synchronization node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a fresh node from an in-process source chain
    Simulate {
        /// Height of the source chain
        #[arg(short, long, default_value_t = 1000)]
        blocks: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging).context("Failed to initialise logging")?;

    match cli.command {
        Commands::Simulate { blocks, timeout_secs } => {
            let chain = build_chain(blocks, SIMULATED_DIFFICULTY);
            let genesis = chain
                .first()
                .cloned()
                .context("Simulated chain has no genesis")?;
            let source: Arc<dyn BlockStore> = Arc::new(store_from_chain(&chain, 0, blocks)?);

            let stats = sync_over_service(config.sync, source, genesis, Duration::from_secs(timeout_secs)).await?;
            info!(
                "Synced to block #{} (td={}) after {} requests",
                stats.best_block_number, stats.total_difficulty, stats.last_request_id
            );
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
