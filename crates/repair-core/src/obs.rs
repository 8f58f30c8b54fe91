//! Structured lifecycle events for repair cycles.
//!
//! Every event carries an `event` field (`cycle.started`, `cycle.phase_changed`, ...)
//! and the `run_id`, so a JSON log stream can be filtered per run.

use tracing::{info, warn};

use crate::domain::{ApprovalVerdict, CyclePhase};

/// RAII guard that keeps a run-scoped span entered.
///
/// ```ignore
/// let _span = CycleSpan::enter("order-repair-42");
/// ```
pub struct CycleSpan {
    _span: tracing::span::EnteredSpan,
}

impl CycleSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: cycle_span(run_id).entered(),
        }
    }
}

/// Span attached to a cycle's background task.
pub fn cycle_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("repair.cycle", run_id = %run_id)
}

pub fn emit_cycle_started(run_id: &str, resumed: bool) {
    info!(event = "cycle.started", run_id = %run_id, resumed = resumed);
}

pub fn emit_phase_changed(run_id: &str, from: CyclePhase, to: CyclePhase) {
    info!(event = "cycle.phase_changed", run_id = %run_id, from = %from, to = %to);
}

pub fn emit_cycle_finished(run_id: &str, phase: CyclePhase, repaired: usize, skipped: usize, failed: usize) {
    info!(
        event = "cycle.finished",
        run_id = %run_id,
        phase = %phase,
        repaired = repaired,
        skipped = skipped,
        failed = failed,
    );
}

pub fn emit_approval_resolved(run_id: &str, verdict: ApprovalVerdict, actor: Option<&str>) {
    info!(
        event = "approval.resolved",
        run_id = %run_id,
        verdict = %verdict,
        actor = actor.unwrap_or("-"),
    );
}

/// An approval signal arrived outside PENDING-APPROVAL.
pub fn emit_signal_ignored(run_id: &str, phase: CyclePhase) {
    warn!(event = "approval.signal_ignored", run_id = %run_id, phase = %phase);
}

pub fn emit_action_resolved(run_id: &str, action_id: &str, outcome: &str, attempts: u32) {
    info!(
        event = "action.resolved",
        run_id = %run_id,
        action_id = %action_id,
        outcome = outcome,
        attempts = attempts,
    );
}

pub fn emit_loop_waiting(correlation_id: &str, iteration: u32, wait_secs: u64) {
    info!(
        event = "loop.waiting",
        correlation_id = %correlation_id,
        iteration = iteration,
        wait_secs = wait_secs,
    );
}

pub fn emit_schedule_fired(schedule_id: &str, run_id: &str) {
    info!(event = "schedule.fired", schedule_id = %schedule_id, run_id = %run_id);
}

/// A cycle stopped on an error and stays resumable.
pub fn emit_cycle_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cycle.error", run_id = %run_id, error = %error);
}
