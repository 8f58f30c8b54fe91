//! Order Repair Agent CLI
//!
//! The `repair-agent` command drives repair cycles over an order/inventory
//! data directory, with cycle state kept in the durable store.
//!
//! ## Commands
//!
//! - `run`: one cycle, prompting for approval when the plan needs it
//! - `proactive`: run cycles on an interval until interrupted
//! - `status`, `plan`, `list`: inspect cycles
//! - `approve`, `reject`, `resume`, `cancel`: act on a cycle
//! - `schedule`: manage time-based triggers
//! - `orders`, `seed`: inspect or create the data directory

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use repair_core::config::{DEFAULT_APPROVAL_TIMEOUT, DEFAULT_LOOP_INTERVAL, DEFAULT_THRESHOLD};
use repair_core::{
    write_report_artifacts, AgentSet, ApprovalSignal, CycleConfig, CycleFilter, CyclePhase,
    CycleReport, CycleSpan, DomainSnapshot, InventoryItem, JsonFileDomainStore, LoopConfig,
    NotificationTarget, Order, OrderLine, ProactiveLoop, RepairOrchestrator, RepairPlan,
    RuleConfig, RunHandle, ScheduleManager, ScheduleSpec, SignalDelivery,
};
use repair_state::{StateStore, SurrealStateStore};

#[derive(Parser)]
#[command(name = "repair-agent")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Detect, plan and repair order problems with human approval", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Durable store URL (mem://, surrealkv://path, ws://host)
    #[arg(long, env = "REPAIR_DB_URL", global = true)]
    db_url: Option<String>,

    /// Directory holding the domain.json order and inventory data
    #[arg(long, env = "REPAIR_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Reference date for stuck-order detection (default: today)
    #[arg(long, env = "REPAIR_ANALYSIS_DATE", global = true)]
    analysis_date: Option<NaiveDate>,

    /// Name recorded on approvals and generated run ids
    #[arg(long, env = "REPAIR_USER", default_value = "operator", global = true)]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct CycleArgs {
    /// Auto-approval threshold for the weakest action
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Seconds a plan waits for a decision before the cycle is cancelled
    #[arg(long, default_value_t = DEFAULT_APPROVAL_TIMEOUT.as_secs())]
    approval_timeout_secs: u64,
}

impl CycleArgs {
    fn to_config(&self) -> CycleConfig {
        CycleConfig::default()
            .with_threshold(self.threshold)
            .with_approval_timeout(Duration::from_secs(self.approval_timeout_secs))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one repair cycle
    Run {
        /// Run id (default: generated)
        #[arg(long)]
        run_id: Option<String>,

        /// Approve the plan without prompting
        #[arg(long)]
        auto_approve: bool,

        /// Write report artifacts under this directory
        #[arg(long)]
        report_dir: Option<PathBuf>,

        #[command(flatten)]
        cycle: CycleArgs,
    },

    /// Run cycles on an interval until interrupted
    Proactive {
        /// Seconds between the end of one cycle and the start of the next
        #[arg(long, default_value_t = DEFAULT_LOOP_INTERVAL.as_secs())]
        interval_secs: u64,

        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u32>,

        /// POST "problems found" notifications to this URL
        #[arg(long)]
        webhook: Option<String>,

        /// Address to email "problems found" notifications to
        #[arg(long, conflicts_with = "webhook")]
        email: Option<String>,

        /// Forward "problems found" notifications into this run's inbox
        #[arg(long, conflicts_with_all = ["webhook", "email"])]
        notify_run: Option<String>,

        #[command(flatten)]
        cycle: CycleArgs,
    },

    /// Show a cycle's status
    Status { run_id: String },

    /// Show a cycle's repair plan
    Plan { run_id: String },

    /// Approve a cycle's plan
    Approve {
        run_id: String,

        #[arg(long)]
        note: Option<String>,
    },

    /// Reject a cycle's plan
    Reject {
        run_id: String,

        #[arg(long)]
        note: Option<String>,
    },

    /// Continue an unfinished cycle from the durable store
    Resume {
        run_id: String,

        #[arg(long)]
        auto_approve: bool,

        #[arg(long)]
        report_dir: Option<PathBuf>,
    },

    /// Cancel a cycle
    Cancel { run_id: String },

    /// List cycles in the store
    List {
        /// Only cycles of this proactive loop or schedule
        #[arg(long)]
        correlation_id: Option<String>,

        /// Only unfinished cycles
        #[arg(long)]
        active: bool,
    },

    /// Manage schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Print the current orders and inventory
    Orders,

    /// Write a small demo data set into the data directory
    Seed {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Clone, Debug)]
struct ScheduleArgs {
    schedule_id: String,

    /// Seconds between firings
    #[arg(long)]
    every_secs: u64,

    #[arg(long)]
    note: Option<String>,

    /// Keep the schedule but do not fire it
    #[arg(long)]
    paused: bool,

    #[command(flatten)]
    cycle: CycleArgs,
}

impl ScheduleArgs {
    fn to_spec(&self) -> ScheduleSpec {
        let spec = ScheduleSpec::new(&self.schedule_id, Duration::from_secs(self.every_secs))
            .with_cycle(self.cycle.to_config())
            .with_paused(self.paused);
        match &self.note {
            Some(note) => spec.with_note(note),
            None => spec,
        }
    }
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Create a schedule (fails if it exists)
    Create(ScheduleArgs),
    /// Create or update a schedule
    Upsert(ScheduleArgs),
    /// Show one schedule
    Describe { schedule_id: String },
    /// Delete a schedule
    Delete { schedule_id: String },
    /// List schedules
    List,
    /// Fire a schedule now
    Trigger { schedule_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    repair_core::init_tracing(cli.json, level);

    if let Commands::Seed { force } = cli.command {
        return cmd_seed(&cli.data_dir, force);
    }

    let orchestrator = build_orchestrator(&cli).await?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Run {
            run_id,
            auto_approve,
            report_dir,
            cycle,
        } => {
            cmd_run(
                &orchestrator,
                run_id,
                cycle.to_config(),
                user,
                auto_approve,
                report_dir.as_deref(),
            )
            .await
        }
        Commands::Proactive {
            interval_secs,
            max_cycles,
            webhook,
            email,
            notify_run,
            cycle,
        } => {
            let target = notification_target(webhook, email, notify_run);
            cmd_proactive(
                &orchestrator,
                user,
                cycle.to_config(),
                Duration::from_secs(interval_secs),
                max_cycles,
                target,
            )
            .await
        }
        Commands::Status { run_id } => cmd_status(&orchestrator, &run_id).await,
        Commands::Plan { run_id } => cmd_plan(&orchestrator, &run_id).await,
        Commands::Approve { run_id, note } => {
            let signal = ApprovalSignal::approve(Some(user.to_string()), note);
            cmd_signal(&orchestrator, &run_id, signal).await
        }
        Commands::Reject { run_id, note } => {
            let signal = ApprovalSignal::reject(Some(user.to_string()), note);
            cmd_signal(&orchestrator, &run_id, signal).await
        }
        Commands::Resume {
            run_id,
            auto_approve,
            report_dir,
        } => {
            let handle = orchestrator
                .resume(&run_id)
                .await
                .with_context(|| format!("Failed to resume cycle '{run_id}'"))?;
            println!("Resumed cycle {run_id}");
            drive(&orchestrator, handle, user, auto_approve, report_dir.as_deref()).await
        }
        Commands::Cancel { run_id } => {
            orchestrator
                .cancel(&run_id)
                .await
                .with_context(|| format!("Failed to cancel cycle '{run_id}'"))?;
            println!("Cancellation requested for {run_id}");
            Ok(())
        }
        Commands::List {
            correlation_id,
            active,
        } => {
            let filter = CycleFilter {
                correlation_id,
                active_only: active,
            };
            cmd_list(&orchestrator, &filter).await
        }
        Commands::Schedule { action } => cmd_schedule(&orchestrator, action).await,
        Commands::Orders => cmd_orders(&orchestrator).await,
        Commands::Seed { .. } => Ok(()),
    }
}

async fn build_orchestrator(cli: &Cli) -> Result<RepairOrchestrator> {
    let store = match &cli.db_url {
        Some(url) => SurrealStateStore::connect(url).await,
        None => SurrealStateStore::from_env().await,
    }
    .context("Failed to connect to the repair state store")?;
    let store: Arc<dyn StateStore> = Arc::new(store);

    let domain = JsonFileDomainStore::open(&cli.data_dir).with_context(|| {
        format!(
            "Failed to open data directory {} (run 'repair-agent seed' to create one)",
            cli.data_dir.display()
        )
    })?;

    let rules = RuleConfig {
        analysis_date: cli.analysis_date.unwrap_or_else(|| Utc::now().date_naive()),
        ..RuleConfig::default()
    };
    Ok(RepairOrchestrator::new(
        AgentSet::rule_based(rules),
        store,
        Arc::new(domain),
    ))
}

fn notification_target(
    webhook: Option<String>,
    email: Option<String>,
    notify_run: Option<String>,
) -> NotificationTarget {
    if let Some(url) = webhook {
        NotificationTarget::Webhook { url }
    } else if let Some(address) = email {
        NotificationTarget::Email {
            address,
            subject: "Order problems found".to_string(),
        }
    } else if let Some(run_id) = notify_run {
        NotificationTarget::Signal { run_id }
    } else {
        NotificationTarget::Log
    }
}

/// Start a cycle and follow it to the end
async fn cmd_run(
    orchestrator: &RepairOrchestrator,
    run_id: Option<String>,
    config: CycleConfig,
    user: &str,
    auto_approve: bool,
    report_dir: Option<&Path>,
) -> Result<()> {
    let run_id = run_id
        .unwrap_or_else(|| format!("repair-{user}-{}", Utc::now().format("%Y%m%d%H%M%S")));
    let handle = orchestrator
        .start(&run_id, config, None)
        .await
        .with_context(|| format!("Failed to start cycle '{run_id}'"))?;
    println!("Started cycle {run_id}");
    drive(orchestrator, handle, user, auto_approve, report_dir).await
}

/// Wait for a hosted cycle, answering its approval request if it makes one
async fn drive(
    orchestrator: &RepairOrchestrator,
    handle: RunHandle,
    user: &str,
    auto_approve: bool,
    report_dir: Option<&Path>,
) -> Result<()> {
    let run_id = handle.run_id().to_string();
    let state = match handle
        .wait_until(|s| s.phase == CyclePhase::PendingApproval || s.is_terminal())
        .await
    {
        Ok(state) => state,
        Err(_) => {
            handle.wait().await?;
            bail!("cycle '{run_id}' stopped before reaching a decision point");
        }
    };

    if state.phase == CyclePhase::PendingApproval {
        if let Some(plan) = &state.plan {
            print_plan(plan);
        }
        let signal = if auto_approve {
            ApprovalSignal::approve(Some(user.to_string()), Some("approved from command line".into()))
        } else {
            prompt_decision(user).await?
        };
        let delivery = orchestrator.signal_approval(&run_id, signal).await?;
        if let SignalDelivery::Ignored { phase } = delivery {
            println!("Decision arrived too late; cycle was already {phase}");
        }
    }

    let report = handle
        .wait()
        .await
        .with_context(|| format!("Cycle '{run_id}' failed"))?;
    print_report(&report);
    if let Some(dir) = report_dir {
        let path = write_report(dir, &report)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn write_report(dir: &Path, report: &CycleReport) -> Result<PathBuf> {
    let _span = CycleSpan::enter(&report.run_id);
    let path = write_report_artifacts(dir, report)
        .with_context(|| format!("Failed to write report under {}", dir.display()))?;
    info!(path = %path.display(), "report artifacts written");
    Ok(path)
}

async fn prompt_decision(user: &str) -> Result<ApprovalSignal> {
    let answer = tokio::task::spawn_blocking(|| -> std::io::Result<String> {
        print!("Approve these repairs? [y/N] ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .context("Approval prompt failed")??;
    Ok(parse_decision(&answer, user))
}

fn parse_decision(answer: &str, user: &str) -> ApprovalSignal {
    let actor = Some(user.to_string());
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "approve" => ApprovalSignal::approve(actor, None),
        _ => ApprovalSignal::reject(actor, Some("declined at prompt".to_string())),
    }
}

fn print_plan(plan: &RepairPlan) {
    println!("Proposed repairs:");
    for action in plan.all_actions() {
        println!(
            "  {:<12} {:<24} confidence {:.2}",
            action.unit_id,
            action.kind(),
            action.confidence
        );
    }
    for skip in &plan.skipped {
        println!("  {:<12} skipped: {}", skip.unit_id, skip.reason);
    }
}

fn print_report(report: &CycleReport) {
    println!();
    println!("Cycle {} ended in {}", report.run_id, report.terminal_phase);
    println!("    {}", report.summary);
    for unit in &report.units {
        println!("  {:<12} {:?}: {}", unit.unit_id, unit.status, unit.detail);
    }
}

/// Run the proactive loop until it finishes or Ctrl-C is pressed
async fn cmd_proactive(
    orchestrator: &RepairOrchestrator,
    user: &str,
    cycle: CycleConfig,
    interval: Duration,
    max_cycles: Option<u32>,
    notification: NotificationTarget,
) -> Result<()> {
    let correlation_id = format!("proactive-{user}-{}", Utc::now().timestamp());
    let config = LoopConfig {
        interval,
        max_cycles,
        notification: Some(notification),
        ..LoopConfig::default()
    };
    let handle = ProactiveLoop::new(orchestrator.clone(), &correlation_id, cycle, config)
        .context("Invalid proactive loop configuration")?
        .spawn();
    println!("Proactive loop {correlation_id} started (Ctrl-C to stop after the current cycle)");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            println!("Stopping after the current cycle...");
            handle.request_exit()?;
        }
        _ = handle.wait_until(|s| s.finished) => {}
    }

    let status = handle.wait().await?;
    println!("Loop {} ran {} cycle(s)", status.correlation_id, status.iteration);
    for summary in &status.history {
        match (&summary.phase, &summary.error) {
            (_, Some(err)) => println!("  {:<32} error: {}", summary.run_id, err),
            (Some(phase), None) => println!(
                "  {:<32} {} ({} repaired, {} skipped, {} failed)",
                summary.run_id, phase, summary.repaired, summary.skipped, summary.failed
            ),
            (None, None) => println!("  {:<32} unknown", summary.run_id),
        }
    }
    Ok(())
}

async fn cmd_status(orchestrator: &RepairOrchestrator, run_id: &str) -> Result<()> {
    let status = orchestrator
        .query_status(run_id)
        .await
        .with_context(|| format!("Failed to load cycle '{run_id}'"))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_plan(orchestrator: &RepairOrchestrator, run_id: &str) -> Result<()> {
    match orchestrator.describe_plan(run_id).await? {
        Some(plan) => print_plan(&plan),
        None => println!("Cycle '{run_id}' has no plan yet"),
    }
    Ok(())
}

async fn cmd_signal(orchestrator: &RepairOrchestrator, run_id: &str, signal: ApprovalSignal) -> Result<()> {
    let delivery = orchestrator
        .signal_approval(run_id, signal)
        .await
        .with_context(|| format!("Failed to signal cycle '{run_id}'"))?;
    match delivery {
        SignalDelivery::Delivered => println!("Decision delivered to {run_id}"),
        SignalDelivery::Queued => {
            println!("Decision queued for {run_id}; it applies when the cycle's host picks it up")
        }
        SignalDelivery::Ignored { phase } => {
            println!("Cycle {run_id} is {phase}, not awaiting approval; decision recorded and ignored")
        }
    }
    Ok(())
}

async fn cmd_list(orchestrator: &RepairOrchestrator, filter: &CycleFilter) -> Result<()> {
    let cycles = orchestrator.list_cycles(filter).await?;
    if cycles.is_empty() {
        println!("No cycles found.");
        return Ok(());
    }
    for cycle in cycles {
        println!(
            "{:<40} {:<22} {}",
            cycle.run_id,
            cycle.phase,
            cycle.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

async fn cmd_schedule(orchestrator: &RepairOrchestrator, action: ScheduleAction) -> Result<()> {
    let manager = ScheduleManager::new(orchestrator.clone());
    match action {
        ScheduleAction::Create(args) => {
            let view = manager.create(args.to_spec()).await?;
            println!(
                "Created schedule '{}' (every {}s)",
                view.spec.schedule_id,
                view.spec.every.as_secs()
            );
        }
        ScheduleAction::Upsert(args) => {
            let created = manager.upsert(args.to_spec()).await?;
            let verb = if created { "Created" } else { "Updated" };
            println!("{verb} schedule '{}'", args.schedule_id);
        }
        ScheduleAction::Describe { schedule_id } => {
            let view = manager.describe(&schedule_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        ScheduleAction::Delete { schedule_id } => {
            manager.delete(&schedule_id).await?;
            println!("Deleted schedule '{schedule_id}'");
        }
        ScheduleAction::List => {
            let views = manager.list().await?;
            if views.is_empty() {
                println!("No schedules found.");
            }
            for view in views {
                let state = if view.spec.paused { "paused" } else { "active" };
                println!(
                    "{:<24} every {:>7}s  {:<6}  next {}",
                    view.spec.schedule_id,
                    view.spec.every.as_secs(),
                    state,
                    view.next_due_at().format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        ScheduleAction::Trigger { schedule_id } => {
            let result = manager.trigger(&schedule_id).await?;
            println!("{}", serde_json::to_string(&result)?);
        }
    }
    Ok(())
}

async fn cmd_orders(orchestrator: &RepairOrchestrator) -> Result<()> {
    let snapshot = orchestrator
        .domain()
        .snapshot()
        .await
        .context("Failed to read orders")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn cmd_seed(data_dir: &Path, force: bool) -> Result<()> {
    if JsonFileDomainStore::is_seeded(data_dir) && !force {
        bail!(
            "{} already holds orders; pass --force to overwrite",
            data_dir.display()
        );
    }
    JsonFileDomainStore::create(data_dir, &demo_snapshot())
        .with_context(|| format!("Failed to seed {}", data_dir.display()))?;
    println!("Seeded demo data in {}", data_dir.display());
    Ok(())
}

/// Four orders: one awaiting approval, one with a failed payment, one short
/// on stock and one already completed.
fn demo_snapshot() -> DomainSnapshot {
    let date = |d: u32| NaiveDate::from_ymd_opt(2025, 6, d).unwrap_or_default();
    let order = |id: &str, day: u32, status: &str, customer: &str, items: Vec<OrderLine>| Order {
        order_id: id.to_string(),
        order_date: date(day),
        status: status.to_string(),
        customer_name: customer.to_string(),
        customer_id: format!("C-{}", &id[2..]),
        payment_method: "credit_card".to_string(),
        items,
    };
    let line = |item: &str, quantity: u32| OrderLine {
        item_id: item.to_string(),
        description: None,
        quantity,
    };
    DomainSnapshot {
        orders: vec![
            order("O-1001", 20, "pending-approval", "Harry Potter", vec![line("I-WAND", 1)]),
            order("O-1002", 22, "payment-failed", "Ron Weasley", vec![line("I-WAND", 1)]),
            order("O-1003", 25, "backordered", "Luna Lovegood", vec![line("I-CAULDRON", 5)]),
            order("O-1004", 10, "completed", "Neville Longbottom", vec![line("I-WAND", 2)]),
        ],
        inventory: vec![
            InventoryItem {
                item_id: "I-WAND".to_string(),
                description: "Holly wand, phoenix feather core".to_string(),
                current_stock: 10,
                available_stock: 10,
                last_ordered: None,
            },
            InventoryItem {
                item_id: "I-CAULDRON".to_string(),
                description: "Pewter cauldron, size 2".to_string(),
                current_stock: 2,
                available_stock: 2,
                last_ordered: None,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use repair_core::MemoryStateStore;

    fn orchestrator(dir: &Path) -> RepairOrchestrator {
        let domain = JsonFileDomainStore::create(dir, &demo_snapshot()).unwrap();
        let rules = RuleConfig {
            analysis_date: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
            ..RuleConfig::default()
        };
        RepairOrchestrator::new(
            AgentSet::rule_based(rules),
            Arc::new(MemoryStateStore::new()),
            Arc::new(domain),
        )
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_schedule_args_parse() {
        let cli = Cli::try_parse_from([
            "repair-agent",
            "schedule",
            "upsert",
            "nightly",
            "--every-secs",
            "86400",
            "--threshold",
            "0.9",
        ])
        .unwrap();
        let Commands::Schedule {
            action: ScheduleAction::Upsert(args),
        } = cli.command
        else {
            panic!("expected schedule upsert");
        };
        let spec = args.to_spec();
        assert_eq!(spec.every, Duration::from_secs(86_400));
        assert_eq!(spec.cycle.threshold, 0.9);
    }

    #[test]
    fn test_prompt_answers() {
        assert_eq!(
            parse_decision("Y\n", "ops").decision,
            repair_core::SignalDecision::Approve
        );
        assert_eq!(
            parse_decision("\n", "ops").decision,
            repair_core::SignalDecision::Reject
        );
    }

    #[test]
    fn test_notification_target_precedence() {
        assert_eq!(notification_target(None, None, None), NotificationTarget::Log);
        assert!(matches!(
            notification_target(None, Some("ops@example.com".into()), None),
            NotificationTarget::Email { .. }
        ));
        assert_eq!(
            notification_target(None, None, Some("inbox".into())),
            NotificationTarget::Signal {
                run_id: "inbox".into()
            }
        );
    }

    #[test]
    fn test_seed_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        cmd_seed(dir.path(), false).unwrap();
        assert!(cmd_seed(dir.path(), false).is_err());
        cmd_seed(dir.path(), true).unwrap();
    }

    #[tokio::test]
    async fn test_run_with_auto_approve_repairs_demo_data() {
        let dir = tempfile::tempdir().unwrap();
        let reports = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        cmd_run(
            &orchestrator,
            Some("cli-run".into()),
            CycleConfig::default(),
            "tester",
            true,
            Some(reports.path()),
        )
        .await
        .unwrap();

        let report = orchestrator.report("cli-run").await.unwrap().unwrap();
        assert_eq!(report.terminal_phase, CyclePhase::ReportCompleted);
        assert_eq!((report.repaired, report.skipped, report.failed), (3, 0, 0));
        let loaded = repair_core::read_report_artifact(reports.path(), "cli-run").unwrap();
        assert_eq!(loaded, report);

        let snapshot = orchestrator.domain().snapshot().await.unwrap();
        let status = |id: &str| snapshot.order(id).map(|o| o.status.clone()).unwrap();
        assert_eq!(status("O-1001"), "approved-preparing-shipment");
        assert_eq!(status("O-1002"), "payment_update_requested");
        assert_eq!(status("O-1003"), "completed");
        assert_eq!(snapshot.item("I-CAULDRON").unwrap().available_stock, 5);
    }
}
