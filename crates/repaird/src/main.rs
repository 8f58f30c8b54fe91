//! Order repair worker.
//!
//! Resumes every unfinished cycle found in the durable store, then fires
//! schedules until Ctrl-C.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use repair_core::{
    AgentSet, CycleFilter, JsonFileDomainStore, RepairOrchestrator, RuleConfig, RunHandle,
    Scheduler, METRICS,
};
use repair_state::{StateStore, SurrealStateStore};

#[derive(Parser)]
#[command(name = "repaird")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Host repair schedules and resume unfinished cycles", long_about = None)]
struct Args {
    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    json: bool,

    #[arg(long, env = "REPAIR_DB_URL")]
    db_url: Option<String>,

    #[arg(long, env = "REPAIR_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Seconds between schedule checks
    #[arg(long, env = "REPAIR_TICK_SECS", default_value_t = 30)]
    tick_secs: u64,

    #[arg(long, env = "REPAIR_ANALYSIS_DATE")]
    analysis_date: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    repair_core::init_tracing(args.json, level);

    let store = match &args.db_url {
        Some(url) => SurrealStateStore::connect(url).await,
        None => SurrealStateStore::from_env().await,
    }
    .context("Failed to connect to the repair state store")?;
    let store: Arc<dyn StateStore> = Arc::new(store);
    let domain = JsonFileDomainStore::open(&args.data_dir)
        .with_context(|| format!("Failed to open data directory {}", args.data_dir.display()))?;
    let rules = RuleConfig {
        analysis_date: args
            .analysis_date
            .unwrap_or_else(|| Utc::now().date_naive()),
        ..RuleConfig::default()
    };
    let orchestrator = RepairOrchestrator::new(AgentSet::rule_based(rules), store, Arc::new(domain));

    let resumed = resume_unfinished(&orchestrator).await?;
    info!(resumed = resumed.len(), "unfinished cycles resumed");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown_tx.send_replace(true);
        }
    });

    let scheduler = Scheduler::new(orchestrator, Duration::from_secs(args.tick_secs.max(1)));
    scheduler.run(shutdown_rx).await?;

    METRICS.flush();
    Ok(())
}

/// Resume every non-terminal cycle in the store.
///
/// A cycle that cannot be resumed is logged and skipped.
async fn resume_unfinished(orchestrator: &RepairOrchestrator) -> Result<Vec<RunHandle>> {
    let filter = CycleFilter {
        correlation_id: None,
        active_only: true,
    };
    let mut handles = Vec::new();
    for cycle in orchestrator.list_cycles(&filter).await? {
        match orchestrator.resume(&cycle.run_id).await {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!(run_id = %cycle.run_id, error = %e, "could not resume cycle"),
        }
    }
    Ok(handles)
}
