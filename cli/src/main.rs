//! Command-line driver for the engine: validate a config file, or replay a recorded
//! JSON chain fixture block by block and report the resulting consensus hash per block.
//! The only place in the workspace that installs a global `tracing` subscriber, the way
//! the teacher's own CLI binary is the sole owner of its logging init.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tl_core::chain_view::ChainView;
use tl_core::config::EngineConfig;
use tl_core::db::persistent::RocksEnv;
use tl_core::engine::{Engine, EngineStores};
use tl_core::replay::{ChainFixture, JsonChainView};

#[derive(Parser)]
#[command(name = "tallyline", version, about = "Tallyline exchange engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate an engine configuration file.
    CheckConfig {
        #[arg(long, default_value = "config")]
        config: String,
        #[arg(long)]
        network: Option<String>,
    },
    /// Replay a recorded JSON chain fixture through the block pipeline.
    Replay {
        #[arg(long, default_value = "config")]
        config: String,
        #[arg(long)]
        network: Option<String>,
        /// Path to a `replay::ChainFixture`-shaped JSON file.
        #[arg(long)]
        fixture: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { config, network } => check_config(&config, network.as_deref()),
        Command::Replay { config, network, fixture } => replay(&config, network.as_deref(), &fixture),
    }
}

fn check_config(path: &str, network: Option<&str>) -> Result<()> {
    let cfg = EngineConfig::load(path, network)?;
    let checkpoints = cfg.checkpoint_table()?;
    println!("network: {:?}", cfg.network);
    println!("db_path: {}", cfg.db_path.display());
    println!("genesis_block: {}", cfg.genesis_block);
    println!("activation_overrides: {}", cfg.activation_overrides.len());
    println!("checkpoints: {}", checkpoints.len());
    Ok(())
}

fn replay(config_path: &str, network: Option<&str>, fixture_path: &PathBuf) -> Result<()> {
    let cfg = EngineConfig::load(config_path, network)?;
    let checkpoints = cfg.checkpoint_table()?;

    let raw = std::fs::read_to_string(fixture_path).with_context(|| format!("failed to read fixture at {}", fixture_path.display()))?;
    let fixture: ChainFixture = serde_json::from_str(&raw).context("failed to parse chain fixture")?;
    let chain = JsonChainView::load(fixture);

    let env = RocksEnv::open(&cfg.db_path)?;
    let stores = EngineStores {
        tx_list: Box::new(env.tx_list()),
        trade_list: Box::new(env.trade_list()),
        sp_info: Box::new(env.sp_info()),
        fee_cache: Box::new(env.fee_cache()),
        fee_history: Box::new(env.fee_history()),
        sto_list: Box::new(env.sto_list()),
        db_tx: Box::new(env.db_transaction()),
    };
    let mut engine = Engine::new(stores);

    for height in chain.heights() {
        engine.on_block_begin(height);
        let block_time = chain.get_block_time(height).unwrap_or(0);
        for (index, tx) in chain.block_txs(height).into_iter().enumerate() {
            engine.on_tx(&chain, &tx, height, index as u32, block_time);
        }
        let hash = engine.on_block_end(height, &checkpoints, cfg.checkpoint_override)?;
        println!("block {height}: {}", tl_core::consensus::hex_hash(&hash));
    }
    Ok(())
}
