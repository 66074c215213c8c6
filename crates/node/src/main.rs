//! FedChain Node
//!
//! Runs the round coordinator against an in-process ledger, content store
//! and prover, with simulated participants submitting gradients each round.
//! Engine state goes to sled so an interrupted round can be inspected.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use fedchain_bridge::{DigestProver, LedgerClient, LocalLeaseProvider, MemoryContentStore, MemoryLedger, StaticTrainer};
use fedchain_coordinator::{
    Collaborators, Coordinator, CoordinatorError, EngineStore, Scheduler, StrategyConfig, SystemScheduler,
};
use fedchain_types::{RoundState, RoundStatus, TensorSet, TOKEN_DECIMALS};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod simulation;

use config::NodeConfig;
use simulation::Simulation;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Fedavg,
    TrimmedMean,
    Median,
}

#[derive(Parser, Debug)]
#[command(name = "fedchain")]
#[command(about = "FedChain round coordinator with simulated participants", long_about = None)]
struct Args {
    /// Number of rounds to run
    #[arg(long, default_value = "3")]
    rounds: u64,

    /// Node configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated participants
    #[arg(long)]
    participants: Option<usize>,

    /// Round duration in seconds
    #[arg(long)]
    round_secs: Option<i64>,

    /// Minimum participants per round
    #[arg(long)]
    min_participants: Option<u64>,

    /// Ledger polling interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Aggregation strategy
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Updates trimmed from each end per coordinate (trimmed-mean only)
    #[arg(long, default_value = "1")]
    trim: usize,

    /// Engine state directory (temporary store when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(participants) = self.participants {
            config.simulation.participants = participants;
        }
        if let Some(round_secs) = self.round_secs {
            config.simulation.round_secs = round_secs;
        }
        if let Some(min_participants) = self.min_participants {
            config.simulation.min_participants = min_participants;
        }
        if let Some(poll_ms) = self.poll_ms {
            config.coordinator.poll_interval_ms = poll_ms;
        }
        if let Some(strategy) = self.strategy {
            config.coordinator.strategy = match strategy {
                StrategyArg::Fedavg => StrategyConfig::FedAvg,
                StrategyArg::TrimmedMean => StrategyConfig::TrimmedMean { trim: self.trim },
                StrategyArg::Median => StrategyConfig::Median,
            };
        }

        config.validate()?;
        Ok(config)
    }
}

fn open_store(data_dir: Option<&PathBuf>) -> Result<EngineStore> {
    match data_dir {
        // The ledger lives in memory, so engine state only means anything within one run
        Some(dir) => {
            let run_dir = dir.join(format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S")));
            tracing::info!("Engine state: {:?}", run_dir);
            EngineStore::open(run_dir)
        }
        None => EngineStore::temporary(),
    }
}

fn format_tokens(units: u128) -> String {
    let whole = units / TOKEN_DECIMALS;
    let frac = (units % TOKEN_DECIMALS) / (TOKEN_DECIMALS / 10_000);
    format!("{}.{:04} FED", whole, frac)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.node_config()?;

    tracing::info!("Starting FedChain coordinator node");
    tracing::info!("  Instance: {}", config.coordinator.instance_id);
    tracing::info!("  Rounds: {}", args.rounds);
    tracing::info!(
        "  Participants: {} ({} required, {:.0}% dropout)",
        config.simulation.participants,
        config.simulation.min_participants,
        config.simulation.dropout * 100.0
    );
    tracing::info!("  Round duration: {}s", config.simulation.round_secs);
    tracing::info!("  Poll interval: {}ms", config.coordinator.poll_interval_ms);
    tracing::info!("  Strategy: {:?}", config.coordinator.strategy);

    let ledger = Arc::new(MemoryLedger::new());
    let content = Arc::new(MemoryContentStore::new());
    let prover = Arc::new(DigestProver::new());
    let scheduler = Arc::new(SystemScheduler);
    let store = Arc::new(open_store(args.data_dir.as_ref())?);

    let mut simulation = Simulation::new(config.simulation.clone(), ledger.clone(), content.clone(), prover.clone());
    simulation.register_participants()?;
    simulation.seed_base_model().await?;

    let deps = Collaborators {
        ledger: ledger.clone(),
        store: content.clone(),
        prover,
        trainer: Arc::new(StaticTrainer::new(TensorSet::default())),
        leases: Arc::new(LocalLeaseProvider::new()),
        scheduler: scheduler.clone(),
    };
    let mut coordinator = Coordinator::new(config.coordinator.clone(), deps, store.clone())?;

    let shutdown = coordinator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            shutdown.trigger();
        }
    });
    tracing::info!("Press Ctrl+C to stop.");

    let started = chrono::Utc::now();
    let mut results: Vec<RoundStatus> = Vec::new();

    for _ in 0..args.rounds {
        let (round_id, participants) = simulation.start_round(scheduler.now());

        let outcome = coordinator.advance_one_round().await;
        for handle in participants {
            handle.abort();
        }

        match outcome {
            Ok(status) => {
                tracing::info!("{}", status);
                results.push(status);
            }
            Err(CoordinatorError::Cancelled) => {
                tracing::info!("Round {} interrupted", round_id);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    store.flush()?;

    let closed = results.iter().filter(|s| s.state == RoundState::Closed).count();
    tracing::info!(
        "Finished {} rounds in {}s: {} closed, {} failed",
        results.len(),
        (chrono::Utc::now() - started).num_seconds(),
        closed,
        results.len() - closed
    );
    if let Some(model_ref) = ledger.current_model().await? {
        tracing::info!("Global model: {}", model_ref.uri());
    }
    for participant in simulation.participants() {
        tracing::info!("  {} earned {}", participant, format_tokens(ledger.balance(participant)));
    }

    tracing::info!("Node stopped");
    Ok(())
}
