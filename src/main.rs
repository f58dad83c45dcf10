//! updown-bot - automated 15-minute binary options trading engine
//!
//! One long-running process. `start` runs the tick loop against a tick
//! source (a JSONL replay file, or an external feed wired to the tick
//! channel), `reconcile-once` runs a single reconciliation pass, and
//! `admin-query` executes a read-only SQL statement against the database.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updown_bot::exchange::{ExchangeClient, PaperExchange};
use updown_bot::strategy::{
    ExpiryConvergence, ExpiryConvergenceConfig, FairValueEdge, FairValueEdgeConfig, MeanReversion,
    MeanReversionConfig, SpotLagMomentum, SpotLagMomentumConfig, Strategy,
};
use updown_bot::{Config, Db, Orchestrator, Tick};

#[derive(Parser)]
#[command(name = "updown-bot", version, about = "Binary options trading engine")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading engine
    Start {
        /// Replay ticks from a JSONL file instead of a live feed
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Run one reconciliation pass and exit
    ReconcileOnce,
    /// Execute a read-only SQL query and print JSON rows
    AdminQuery {
        /// The SELECT statement to run
        sql: String,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "updown_bot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("load configuration")?;
    let db = Db::open(&config.engine.db_path).context("open database")?;

    match cli.command {
        Command::Start { replay } => start(config, db, replay).await,
        Command::ReconcileOnce => reconcile_once(config, db).await,
        Command::AdminQuery { sql } => admin_query(db, &sql).await,
    }
}

fn default_strategies() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(FairValueEdge::new(FairValueEdgeConfig::default())),
        Box::new(SpotLagMomentum::new(SpotLagMomentumConfig::default())),
        Box::new(ExpiryConvergence::new(ExpiryConvergenceConfig::default())),
        Box::new(MeanReversion::new(MeanReversionConfig::default())),
    ]
}

async fn start(config: Config, db: Db, replay: Option<PathBuf>) -> Result<()> {
    info!(mode = %config.engine.mode, "starting engine");
    let exchange = Arc::new(PaperExchange::new());
    let mut orchestrator = Orchestrator::new(config, db, exchange)
        .context("build orchestrator")?
        .with_strategies(default_strategies());
    orchestrator
        .bootstrap()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("bootstrap")?;

    let (tick_tx, tick_rx) = mpsc::channel::<Tick>(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ctrl-c flips the shutdown signal; in-flight ticks complete first
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    // held open so the loop keeps running when no feed is attached
    let mut standby_tx = Some(tick_tx);
    match replay {
        Some(path) => {
            if let Some(tx) = standby_tx.take() {
                tokio::spawn(async move {
                    if let Err(e) = replay_ticks(path, tx).await {
                        error!(error = %e, "tick replay failed");
                    }
                });
            }
        }
        None => {
            warn!("no tick source configured; attach a feed to the tick channel or pass --replay");
        }
    }

    let result = orchestrator.run(tick_rx, shutdown_rx).await;
    drop(standby_tx);
    result
}

/// Feed ticks from a JSONL capture, one tick object per line
async fn replay_ticks(path: PathBuf, tx: mpsc::Sender<Tick>) -> Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("open replay file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut sent = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Tick>(&line) {
            Ok(tick) => {
                if tx.send(tick).await.is_err() {
                    break;
                }
                sent += 1;
            }
            Err(e) => warn!(error = %e, "skipping malformed tick line"),
        }
    }
    info!(sent, "replay complete");
    Ok(())
}

async fn reconcile_once(config: Config, db: Db) -> Result<()> {
    let exchange: Arc<dyn ExchangeClient> = Arc::new(PaperExchange::new());
    let orchestrator =
        Orchestrator::new(config, db, Arc::clone(&exchange)).context("build orchestrator")?;
    let report = orchestrator
        .manager()
        .reconcile(exchange.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    println!(
        "{}",
        serde_json::json!({
            "verified": report.verified,
            "divergences": report
                .divergences
                .iter()
                .map(|d| serde_json::json!({
                    "position_id": d.position_id,
                    "token_id": d.token_id,
                    "type": d.kind.as_str(),
                }))
                .collect::<Vec<_>>(),
            "timestamp": report.timestamp,
            "success": report.success,
        })
    );
    if !report.success {
        bail!("reconciliation found {} divergences", report.divergences.len());
    }
    Ok(())
}

async fn admin_query(db: Db, sql: &str) -> Result<()> {
    let trimmed = sql.trim_start().to_ascii_lowercase();
    if !(trimmed.starts_with("select") || trimmed.starts_with("with")) {
        bail!("admin-query only accepts read-only SELECT statements");
    }
    let rows = db.all(sql, &[]).await?;
    for row in &rows {
        println!("{row}");
    }
    info!(rows = rows.len(), "query complete");
    Ok(())
}
