//! Phase logic of a single cycle.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use repair_state::{CycleStore, SignalRecord, StorageError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{persist, HostedSignal, Inner, APPROVAL_SIGNAL_KIND, CANCEL_SIGNAL_KIND};
use crate::agents::DetectionAgent;
use crate::approval::evaluate_gate;
use crate::dispatch::{dispatch_actions, DispatchConfig};
use crate::domain::{
    ActionOutcome, AgentError, AgentResult, ApprovalSignal, ApprovalVerdict, CyclePhase,
    CycleReport, CycleState, Detection, Diagnosis, DomainSnapshot, IgnoredSignal, PhaseTransition,
    ProblemUnit, RepairError, RepairPlan, Result,
};
use crate::metrics::METRICS;
use crate::obs;

const BELOW_FLOOR: &str = "confidence below execution floor";
const REJECTED: &str = "plan rejected";
const EXPIRED: &str = "approval window expired";
const CANCELLED: &str = "run cancelled";
const TASK_LOST: &str = "dispatch task aborted";

enum Analysis {
    Diagnosed(Diagnosis),
    Unusable(String),
}

enum ApprovalWake {
    Signal(HostedSignal),
    Inbox,
    Deadline,
    Cancelled,
}

/// Keeps the run's lease alive and relays cancel requests from the inbox.
/// Stops when dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(inner: Arc<Inner>, run_id: String, cancel: Arc<watch::Sender<bool>>) -> Self {
        let every = (inner.lease.ttl / 3).max(std::time::Duration::from_millis(10));
        Self(tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match inner.store.take_signals(&run_id, CANCEL_SIGNAL_KIND).await {
                    Ok(requests) if !requests.is_empty() => {
                        info!(run_id = %run_id, "cancel requested through inbox");
                        cancel.send_replace(true);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(run_id = %run_id, error = %e, "cancel inbox check failed"),
                }
                let renewed = inner
                    .store
                    .renew_lease(&run_id, &inner.lease.host_id, inner.lease_until())
                    .await;
                match renewed {
                    Ok(()) => {}
                    Err(e @ (StorageError::LeaseHeld { .. } | StorageError::CycleFinished { .. })) => {
                        warn!(run_id = %run_id, error = %e, "run lease lost; stopping");
                        cancel.send_replace(true);
                        return;
                    }
                    Err(e) => warn!(run_id = %run_id, error = %e, "lease renewal failed"),
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(super) struct CycleRunner {
    inner: Arc<Inner>,
    state: CycleState,
    /// Version of the record this runner last wrote or claimed.
    version: u64,
    status_tx: watch::Sender<CycleState>,
    approvals: mpsc::UnboundedReceiver<HostedSignal>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel: watch::Receiver<bool>,
    resumed: bool,
}

impl CycleRunner {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        inner: Arc<Inner>,
        state: CycleState,
        status_tx: watch::Sender<CycleState>,
        approvals: mpsc::UnboundedReceiver<HostedSignal>,
        cancel_tx: Arc<watch::Sender<bool>>,
        cancel: watch::Receiver<bool>,
        version: u64,
        resumed: bool,
    ) -> Self {
        Self {
            inner,
            state,
            version,
            status_tx,
            approvals,
            cancel_tx,
            cancel,
            resumed,
        }
    }

    pub(super) async fn run(mut self) -> Result<CycleReport> {
        let run_id = self.state.run_id.clone();
        obs::emit_cycle_started(&run_id, self.resumed);
        if !self.resumed {
            METRICS.inc_cycles_started();
        }
        let _heartbeat = Heartbeat::start(
            Arc::clone(&self.inner),
            run_id.clone(),
            Arc::clone(&self.cancel_tx),
        );

        while !self.state.is_terminal() {
            let step = match self.state.phase {
                CyclePhase::DetectingProblems => self.detect().await,
                CyclePhase::PlanningRepair => self.plan().await,
                CyclePhase::PendingApproval => self.await_approval().await,
                CyclePhase::PendingRepair => self.repair().await,
                CyclePhase::PendingReport => self.report().await,
                phase => Err(RepairError::InvalidTransition {
                    from: phase.to_string(),
                    to: "cycle phase".to_string(),
                }),
            };
            if let Err(e) = step {
                obs::emit_cycle_error(&run_id, &e);
                if matches!(e, RepairError::LeaseLost { .. }) {
                    return Err(e);
                }
                let reason = format!("failed in {}: {e}", self.state.phase);
                if let Err(finish) = self.cancel_cycle(&reason).await {
                    warn!(error = %finish, "could not record failed cycle as cancelled");
                    self.release_lease().await;
                    return Err(e);
                }
            }
        }

        match self.state.report.clone() {
            Some(report) => Ok(report),
            None => Ok(self.tally_local(self.state.phase, "finished")),
        }
    }

    // ----- phases -------------------------------------------------------

    async fn detect(&mut self) -> Result<()> {
        let snapshot = self.snapshot().await?;
        let detector = Arc::clone(&self.inner.agents.detector);
        // Malformed detector output is retried like a transient failure.
        let detection = match self
            .call_agent(
                "detection",
                || checked_detection(detector.as_ref(), &snapshot),
                |e: &AgentError| e.is_retryable() || matches!(e, AgentError::Malformed(_)),
            )
            .await
        {
            None => return self.cancel_cycle(CANCELLED).await,
            Some(Ok(d)) => d,
            Some(Err(source)) => {
                return Err(RepairError::Agent {
                    stage: "detection",
                    source,
                })
            }
        };

        let has_problems = detection.has_problems(self.state.config.min_detection_confidence);
        info!(
            units = detection.units.len(),
            confidence = detection.confidence,
            has_problems,
            "detection finished"
        );
        if has_problems {
            let mut units: Vec<ProblemUnit> = Vec::with_capacity(detection.units.len());
            for unit in &detection.units {
                if !units.iter().any(|u| u.unit_id == unit.unit_id) {
                    units.push(unit.clone());
                }
            }
            self.state.units = units;
        }
        self.state.detection = Some(detection);

        if has_problems {
            self.advance(CyclePhase::PlanningRepair).await
        } else {
            self.finish_local(CyclePhase::CompletedNoAction, "No problems detected")
                .await
        }
    }

    async fn plan(&mut self) -> Result<()> {
        let snapshot = self.snapshot().await?;

        for unit in self.state.units.clone() {
            let done = self.state.diagnoses.iter().any(|d| d.unit_id == unit.unit_id)
                || self.state.analysis_skips.iter().any(|s| s.unit_id == unit.unit_id);
            if done {
                continue;
            }
            match self.analyze(&unit, &snapshot).await? {
                None => return self.cancel_cycle(CANCELLED).await,
                Some(Analysis::Diagnosed(d)) => self.state.diagnoses.push(d),
                Some(Analysis::Unusable(reason)) => {
                    warn!(unit_id = %unit.unit_id, reason = %reason, "unit skipped after analysis");
                    self.state
                        .analysis_skips
                        .push(crate::domain::SkippedUnit::new(&unit.unit_id, reason));
                }
            }
            self.checkpoint().await?;
        }

        if self.state.diagnoses.is_empty() {
            self.state.plan = Some(RepairPlan::new());
            return self.advance(CyclePhase::PendingReport).await;
        }

        let diagnoses = self.state.diagnoses.clone();
        let planner = Arc::clone(&self.inner.agents.planner);
        let proposed = match self
            .call_agent("planning", || planner.plan(&diagnoses, &snapshot), AgentError::is_retryable)
            .await
        {
            None => return self.cancel_cycle(CANCELLED).await,
            Some(Ok(plan)) => plan,
            Some(Err(AgentError::Malformed(msg))) => return self.malformed_plan(msg).await,
            Some(Err(source)) => {
                return Err(RepairError::Agent {
                    stage: "planning",
                    source,
                })
            }
        };

        let mut plan = proposed;
        plan.cover_unplanned(&diagnoses);
        if let Err(e) = plan.validate(&diagnoses) {
            return self.malformed_plan(e.to_string()).await;
        }

        for action in plan.all_actions() {
            self.state
                .outcomes
                .insert(action.action_id.as_str().to_string(), ActionOutcome::Pending);
        }
        let now = Utc::now();
        let decision = evaluate_gate(&plan, None, self.state.config.threshold, now);
        self.state.plan = Some(plan);

        match decision {
            Some(decision) => {
                METRICS.inc_auto_approvals();
                obs::emit_approval_resolved(
                    &self.state.run_id,
                    decision.verdict,
                    decision.actor.as_deref(),
                );
                self.state.approval = Some(decision);
                self.advance(CyclePhase::PendingRepair).await
            }
            None => {
                let timeout = chrono::Duration::from_std(self.state.config.approval_timeout)
                    .map_err(|e| RepairError::InvalidConfig(e.to_string()))?;
                self.state.approval_deadline = Some(now + timeout);
                self.advance(CyclePhase::PendingApproval).await
            }
        }
    }

    async fn await_approval(&mut self) -> Result<()> {
        let deadline_at = match self.state.approval_deadline {
            Some(at) => at,
            None => {
                let timeout = chrono::Duration::from_std(self.state.config.approval_timeout)
                    .map_err(|e| RepairError::InvalidConfig(e.to_string()))?;
                let at = Utc::now() + timeout;
                self.state.approval_deadline = Some(at);
                self.checkpoint().await?;
                at
            }
        };
        let remaining = (deadline_at - Utc::now()).to_std().unwrap_or_default();
        let deadline = Instant::now() + remaining;
        info!(deadline = %deadline_at, "awaiting approval");

        if let Some(signal) = self.take_inbox().await? {
            return self.resolve_approval(signal).await;
        }

        let poll_every = self.state.config.signal_poll_interval;
        let mut cancel = self.cancel.clone();
        loop {
            let wake = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => ApprovalWake::Cancelled,
                Some(signal) = self.approvals.recv() => ApprovalWake::Signal(signal),
                _ = sleep_until(deadline) => ApprovalWake::Deadline,
                _ = poll_tick(poll_every) => ApprovalWake::Inbox,
            };
            match wake {
                ApprovalWake::Signal(hosted) if hosted.observed != CyclePhase::PendingApproval => {
                    // The caller was told the signal was ignored.
                    self.ignore(hosted.signal, hosted.observed, Utc::now());
                    self.checkpoint().await?;
                }
                ApprovalWake::Signal(hosted) => return self.resolve_approval(hosted.signal).await,
                ApprovalWake::Deadline => {
                    info!("approval window expired");
                    self.state.skip_pending(EXPIRED);
                    return self.finish_local(CyclePhase::Cancelled, EXPIRED).await;
                }
                ApprovalWake::Cancelled => return self.cancel_cycle(CANCELLED).await,
                ApprovalWake::Inbox => {
                    if let Some(signal) = self.take_inbox().await? {
                        return self.resolve_approval(signal).await;
                    }
                }
            }
        }
    }

    async fn repair(&mut self) -> Result<()> {
        let floor = self.state.config.min_action_confidence;
        for action in self.state.pending_actions() {
            if action.confidence < floor {
                self.record_outcome(
                    action.action_id.as_str().to_string(),
                    ActionOutcome::Skipped {
                        reason: BELOW_FLOOR.to_string(),
                    },
                );
            }
        }
        self.checkpoint().await?;

        let pending = self.state.pending_actions();
        if !pending.is_empty() {
            let config = DispatchConfig {
                max_concurrent: self.state.config.max_concurrent_actions,
                retry: self.state.config.action_retry.clone(),
            };
            let mut rx = dispatch_actions(
                &self.state.run_id,
                Arc::clone(&self.inner.domain),
                pending,
                config,
                self.cancel.clone(),
            );
            while let Some(resolved) = rx.recv().await {
                self.record_outcome(resolved.action_id, resolved.outcome);
                self.checkpoint().await?;
            }
            for action in self.state.pending_actions() {
                self.record_outcome(
                    action.action_id.as_str().to_string(),
                    ActionOutcome::Failed {
                        error: TASK_LOST.to_string(),
                        attempts: 0,
                    },
                );
            }
        }

        if *self.cancel.borrow() {
            return self.cancel_cycle(CANCELLED).await;
        }
        self.advance(CyclePhase::PendingReport).await
    }

    async fn report(&mut self) -> Result<()> {
        let mut report = CycleReport::tally(&self.state, CyclePhase::ReportCompleted);
        let reporter = Arc::clone(&self.inner.agents.reporter);
        let narrative = self
            .state
            .config
            .agent_retry
            .retry(
                "agent.reporting",
                || reporter.summarize(&report),
                |e: &AgentError| e.is_retryable(),
            )
            .await;
        let mut summary = match narrative {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => report.counts_line(),
            Err(e) => {
                warn!(error = %e, "reporting agent failed; using counts");
                report.counts_line()
            }
        };
        if let Some(err) = &self.state.plan_error {
            summary = format!("Plan was malformed ({err}); nothing executed. {summary}");
        }
        report.summary = summary;
        self.state.report = Some(report);
        self.advance(CyclePhase::ReportCompleted).await
    }

    // ----- helpers ------------------------------------------------------

    async fn analyze(&self, unit: &ProblemUnit, snapshot: &DomainSnapshot) -> Result<Option<Analysis>> {
        let analyzer = Arc::clone(&self.inner.agents.analyzer);
        let max = self.state.config.analysis_max_attempts;
        let mut last = String::new();
        for attempt in 1..=max {
            let diagnosis = match self
                .call_agent("analysis", || analyzer.analyze(unit, snapshot), AgentError::is_retryable)
                .await
            {
                None => return Ok(None),
                Some(Ok(d)) => d.validate_for(unit).map(|()| d),
                Some(Err(e)) => Err(e),
            };
            match diagnosis {
                Ok(d) => return Ok(Some(Analysis::Diagnosed(d))),
                Err(AgentError::Malformed(msg)) => {
                    debug!(unit_id = %unit.unit_id, attempt, error = %msg, "analysis output rejected");
                    last = msg;
                }
                Err(source) => {
                    return Err(RepairError::Agent {
                        stage: "analysis",
                        source,
                    })
                }
            }
        }
        Ok(Some(Analysis::Unusable(format!(
            "no usable diagnosis after {max} attempt(s): {last}"
        ))))
    }

    /// Call an agent under the cycle's agent retry policy, retrying errors
    /// `retry_if` accepts. `None` if the run was cancelled first.
    async fn call_agent<T, F, Fut, P>(&self, stage: &str, op: F, retry_if: P) -> Option<AgentResult<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AgentResult<T>>,
        P: Fn(&AgentError) -> bool,
    {
        let label = format!("agent.{stage}");
        let mut cancel = self.cancel.clone();
        let policy = &self.state.config.agent_retry;
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            result = policy.retry(&label, op, retry_if) => Some(result),
        }
    }

    async fn snapshot(&self) -> Result<DomainSnapshot> {
        let domain = Arc::clone(&self.inner.domain);
        let snapshot = self
            .state
            .config
            .agent_retry
            .retry(
                "domain.snapshot",
                || domain.snapshot(),
                |e: &crate::domain::ActionError| e.is_retryable(),
            )
            .await?;
        Ok(snapshot)
    }

    /// First inbox signal that arrived while the run was awaiting approval.
    ///
    /// Signals that predate the phase were answered `Ignored` and are
    /// recorded that way, as are any beyond the first.
    async fn take_inbox(&mut self) -> Result<Option<ApprovalSignal>> {
        let records = self
            .inner
            .store
            .take_signals(&self.state.run_id, APPROVAL_SIGNAL_KIND)
            .await?;
        let entered = self.entered_at(CyclePhase::PendingApproval);
        let mut first = None;
        for record in records {
            let Some(signal) = decode_signal(&record) else {
                continue;
            };
            let early = entered.is_some_and(|at| record.received_at < at);
            if early {
                self.record_ignored(signal, CyclePhase::PlanningRepair, record.received_at);
            } else if first.is_none() {
                first = Some(signal);
            } else {
                self.ignore(signal, CyclePhase::PendingApproval, record.received_at);
            }
        }
        Ok(first)
    }

    fn entered_at(&self, phase: CyclePhase) -> Option<DateTime<Utc>> {
        self.state
            .history
            .iter()
            .rev()
            .find(|t| t.phase == phase)
            .map(|t| t.at)
    }

    /// Record every queued inbox signal as ignored in the current phase.
    /// Outside PENDING-APPROVAL their senders already counted them.
    async fn drain_inbox(&mut self) {
        match self
            .inner
            .store
            .take_signals(&self.state.run_id, APPROVAL_SIGNAL_KIND)
            .await
        {
            Ok(records) => {
                let phase = self.state.phase;
                for record in records {
                    let Some(signal) = decode_signal(&record) else {
                        continue;
                    };
                    if phase == CyclePhase::PendingApproval {
                        self.ignore(signal, phase, record.received_at);
                    } else {
                        self.record_ignored(signal, phase, record.received_at);
                    }
                }
            }
            Err(e) => warn!(error = %e, "approval inbox drain failed"),
        }
    }

    /// Drop this process's lease so another host can pick the run up.
    async fn release_lease(&self) {
        if let Err(e) = self
            .inner
            .store
            .release_cycle(&self.state.run_id, &self.inner.lease.host_id)
            .await
        {
            warn!(error = %e, "could not release run lease");
        }
    }

    async fn resolve_approval(&mut self, signal: ApprovalSignal) -> Result<()> {
        let Some(plan) = &self.state.plan else {
            return Err(RepairError::MalformedPlan("awaiting approval without a plan".into()));
        };
        let Some(decision) = evaluate_gate(plan, Some(&signal), self.state.config.threshold, Utc::now())
        else {
            return Err(RepairError::MalformedPlan("approval gate did not resolve".into()));
        };
        obs::emit_approval_resolved(&self.state.run_id, decision.verdict, decision.actor.as_deref());

        let proceed = decision.verdict.allows_proceed();
        let rejected_by = match decision.verdict {
            ApprovalVerdict::Rejected => Some(decision.actor.clone().unwrap_or_else(|| "unknown".into())),
            _ => None,
        };
        self.state.approval = Some(decision);

        if proceed {
            return self.advance(CyclePhase::PendingRepair).await;
        }
        self.state.skip_pending(REJECTED);
        let reason = format!("{REJECTED} by {}", rejected_by.unwrap_or_default());
        self.state.cancel_reason = Some(reason.clone());
        self.finish_local(CyclePhase::Cancelled, &reason).await
    }

    async fn malformed_plan(&mut self, msg: String) -> Result<()> {
        warn!(error = %msg, "planner returned a malformed plan; skipping all units");
        let mut plan = RepairPlan::new();
        for diagnosis in &self.state.diagnoses {
            plan.skip(&diagnosis.unit_id, format!("malformed plan: {msg}"));
        }
        self.state.plan = Some(plan);
        self.state.plan_error = Some(msg);
        self.advance(CyclePhase::PendingReport).await
    }

    async fn cancel_cycle(&mut self, reason: &str) -> Result<()> {
        info!(reason, "cycle cancelled");
        self.state.skip_pending(reason);
        if self.state.cancel_reason.is_none() {
            self.state.cancel_reason = Some(reason.to_string());
        }
        self.finish_local(CyclePhase::Cancelled, reason).await
    }

    /// Terminal transition that does not go through the reporting agent.
    async fn finish_local(&mut self, phase: CyclePhase, reason: &str) -> Result<()> {
        let report = self.tally_local(phase, reason);
        self.state.report = Some(report);
        self.advance(phase).await
    }

    fn tally_local(&self, phase: CyclePhase, reason: &str) -> CycleReport {
        let mut report = CycleReport::tally(&self.state, phase);
        report.summary = format!("{reason}: {}", report.counts_line());
        report
    }

    fn record_outcome(&mut self, action_id: String, outcome: ActionOutcome) {
        let attempts = match &outcome {
            ActionOutcome::Succeeded { attempts, .. } | ActionOutcome::Failed { attempts, .. } => *attempts,
            _ => 0,
        };
        METRICS.inc_action(outcome.label());
        obs::emit_action_resolved(&self.state.run_id, &action_id, outcome.label(), attempts);
        self.state.outcomes.insert(action_id, outcome);
    }

    /// Count, log and record a signal whose sender was not told it was ignored.
    fn ignore(&mut self, signal: ApprovalSignal, phase: CyclePhase, received_at: DateTime<Utc>) {
        METRICS.inc_signals_ignored();
        obs::emit_signal_ignored(&self.state.run_id, phase);
        self.record_ignored(signal, phase, received_at);
    }

    fn record_ignored(&mut self, signal: ApprovalSignal, phase: CyclePhase, received_at: DateTime<Utc>) {
        self.state.ignored_signals.push(IgnoredSignal {
            signal,
            phase,
            received_at,
        });
    }

    /// Record every signal queued on the channel as ignored in the phase its
    /// sender saw, which is never later than the current one.
    fn drain_ignored(&mut self) {
        while let Ok(hosted) = self.approvals.try_recv() {
            let phase = if hosted.observed == CyclePhase::PendingApproval {
                self.state.phase
            } else {
                hosted.observed
            };
            self.ignore(hosted.signal, phase, Utc::now());
        }
    }

    async fn advance(&mut self, next: CyclePhase) -> Result<()> {
        let from = self.state.phase;
        if !from.can_advance_to(next) {
            return Err(RepairError::InvalidTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        // Whatever arrived during `from` is recorded against `from`.
        self.drain_ignored();
        self.drain_inbox().await;
        self.state.phase = next;
        self.state.history.push(PhaseTransition {
            phase: next,
            at: Utc::now(),
        });
        obs::emit_phase_changed(&self.state.run_id, from, next);
        if next.is_terminal() {
            METRICS.inc_cycles_finished();
            let (repaired, skipped, failed) = self
                .state
                .report
                .as_ref()
                .map_or((0, 0, 0), |r| (r.repaired, r.skipped, r.failed));
            obs::emit_cycle_finished(&self.state.run_id, next, repaired, skipped, failed);
        }
        self.checkpoint().await
    }

    /// Persist, then publish.
    async fn checkpoint(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        self.version = persist(&self.inner, &self.state, self.version).await?;
        self.status_tx.send_replace(self.state.clone());
        Ok(())
    }
}

async fn checked_detection(detector: &dyn DetectionAgent, snapshot: &DomainSnapshot) -> AgentResult<Detection> {
    let detection = detector.detect(snapshot).await?;
    if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence) {
        return Err(AgentError::Malformed(format!(
            "detection confidence {} outside [0, 1]",
            detection.confidence
        )));
    }
    Ok(detection)
}

pub(super) fn decode_signal(record: &SignalRecord) -> Option<ApprovalSignal> {
    match serde_json::from_value(record.payload.clone()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(signal_id = %record.signal_id, error = %e, "dropping undecodable approval signal");
            None
        }
    }
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        futures::future::pending::<()>().await;
    }
}

async fn poll_tick(every: Option<std::time::Duration>) {
    match every {
        Some(d) => sleep(d).await,
        None => futures::future::pending::<()>().await,
    }
}
