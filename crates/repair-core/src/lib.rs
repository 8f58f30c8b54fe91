//! Repair Agent Core Library
//!
//! Detect, analyze, plan, repair and report on order/inventory problems as a
//! durable per-run state machine, with human approval below a confidence
//! threshold and an optional proactive loop.

pub mod agents;
pub mod approval;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod domain_store;
pub mod heuristics;
pub mod metrics;
pub mod notify;
pub mod obs;
pub mod orchestrator;
pub mod proactive;
pub mod reporting;
pub mod retry;
pub mod schedule;
pub mod service;
pub mod telemetry;

pub use domain::{
    ActionError, ActionKind, ActionOutcome, AgentError, AgentResult, ApprovalDecision,
    ApprovalSignal, ApprovalVerdict, CyclePhase, CycleReport, CycleState, Detection, Diagnosis,
    DomainSnapshot, InventoryItem, Order, OrderLine, ProblemUnit, RepairAction, RepairError,
    RepairPlan, RepairTool, Result, SignalDecision, UnitReport, UnitStatus,
};

pub use agents::{AgentSet, AnalysisAgent, DetectionAgent, PlanningAgent, ReportingAgent};
pub use approval::{evaluate_gate, requires_approval, AUTO_APPROVER};
pub use config::{CycleConfig, LoopConfig, RuleConfig};
pub use domain_store::{ApplyReceipt, DomainStore, JsonFileDomainStore, MemoryDomainStore};
pub use heuristics::{RuleAnalyzer, RuleDetector, RulePlanner, SummaryReporter};
pub use notify::{NotificationTarget, Notifier, ProblemNotification};
pub use orchestrator::{CycleStatus, LeaseConfig, RepairOrchestrator, RunHandle, SignalDelivery};
pub use proactive::{CycleSummary, LoopControl, LoopHandle, LoopStatus, ProactiveLoop};
pub use reporting::{read_report_artifact, render_report_md, write_report_artifacts};
pub use retry::RetryPolicy;
pub use schedule::{FireResult, ScheduleManager, ScheduleSpec, ScheduleView, Scheduler};
pub use service::RepairService;

pub use repair_state::{CycleFilter, MemoryStateStore, StateStore, SurrealStateStore};

pub use metrics::METRICS;
pub use obs::{
    emit_cycle_finished, emit_cycle_started, emit_phase_changed, emit_schedule_fired, CycleSpan,
};
pub use telemetry::init_tracing;

/// Repair agent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
