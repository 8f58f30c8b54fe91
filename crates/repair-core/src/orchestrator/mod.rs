//! The repair orchestrator: one durable state machine per run.
//!
//! Each run is driven by a background task that owns its [`CycleState`].
//! The task persists every transition and every action outcome to the
//! [`StateStore`] before moving on, then publishes the new state on a
//! `watch` channel. Status queries read that channel (or the store for runs
//! not hosted by this process), so they never block the run and never see a
//! half-applied transition.
//!
//! A hosting process holds a lease on the cycle record (its host id plus an
//! expiry, renewed by a heartbeat) and writes with the record version as a
//! compare-and-set token. Another process can only resume a run whose lease
//! is free or expired, and a process that lost its lease cannot write.

mod runner;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use repair_state::{CycleFilter, CycleRecord, CycleStore, SignalRecord, StateStore, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use crate::agents::AgentSet;
use crate::config::CycleConfig;
use crate::domain::{
    ActionOutcome, ApprovalDecision, ApprovalSignal, CyclePhase, CycleReport, CycleState,
    IgnoredSignal, PhaseTransition, RepairError, RepairPlan, Result,
};
use crate::domain_store::DomainStore;
use crate::metrics::METRICS;
use crate::obs;

use runner::CycleRunner;

/// Inbox kind for approval decisions sent from another process.
pub const APPROVAL_SIGNAL_KIND: &str = "approval";

/// Inbox kind for cancel requests addressed to a run hosted elsewhere.
pub const CANCEL_SIGNAL_KIND: &str = "cancel";

/// Default lifetime of a run lease between heartbeats.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Identity and lease lifetime of this hosting process.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub host_id: String,
    /// A host that stops renewing loses its runs after this long.
    pub ttl: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            host_id: format!("host-{}", uuid::Uuid::new_v4()),
            ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl LeaseConfig {
    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        now + ttl
    }
}

/// What happened to an approval signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum SignalDelivery {
    /// Handed to the live run waiting for approval.
    Delivered,
    /// Stored in the run's durable inbox; applied when the run resumes.
    Queued,
    /// The run was not awaiting approval. Recorded, no effect.
    Ignored { phase: CyclePhase },
}

/// Read-only view of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStatus {
    pub run_id: String,
    pub correlation_id: Option<String>,
    pub phase: CyclePhase,
    /// Hosted by this process right now.
    pub active: bool,
    pub detection_confidence: Option<f64>,
    pub plan: Option<RepairPlan>,
    pub plan_error: Option<String>,
    pub outcomes: BTreeMap<String, ActionOutcome>,
    pub approval: Option<ApprovalDecision>,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub ignored_signals: Vec<IgnoredSignal>,
    pub report: Option<CycleReport>,
    pub history: Vec<PhaseTransition>,
    pub updated_at: DateTime<Utc>,
}

impl CycleStatus {
    pub fn from_state(state: &CycleState, active: bool) -> Self {
        Self {
            run_id: state.run_id.clone(),
            correlation_id: state.correlation_id.clone(),
            phase: state.phase,
            active,
            detection_confidence: state.detection_confidence(),
            plan: state.plan.clone(),
            plan_error: state.plan_error.clone(),
            outcomes: state.outcomes.clone(),
            approval: state.approval.clone(),
            approval_deadline: state.approval_deadline,
            cancel_reason: state.cancel_reason.clone(),
            ignored_signals: state.ignored_signals.clone(),
            report: state.report.clone(),
            history: state.history.clone(),
            updated_at: state.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Handle to a run started or resumed by this process.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    status: watch::Receiver<CycleState>,
    join: JoinHandle<Result<CycleReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Latest published state.
    pub fn status(&self) -> CycleState {
        self.status.borrow().clone()
    }

    /// A receiver that sees every published state.
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.status.clone()
    }

    /// Wait until the published state satisfies `pred`.
    pub async fn wait_until<F>(&self, pred: F) -> Result<CycleState>
    where
        F: FnMut(&CycleState) -> bool,
    {
        let mut rx = self.status.clone();
        let state = rx
            .wait_for(pred)
            .await
            .map_err(|_| RepairError::TaskAborted("run ended before the condition held".into()))?;
        Ok(state.clone())
    }

    pub async fn wait_for_phase(&self, phase: CyclePhase) -> Result<CycleState> {
        self.wait_until(|s| s.phase == phase).await
    }

    /// Wait for the run to finish and return its report.
    pub async fn wait(self) -> Result<CycleReport> {
        self.join
            .await
            .map_err(|e| RepairError::TaskAborted(e.to_string()))?
    }
}

/// An approval signal handed to a hosted run, with the phase the caller saw.
pub(crate) struct HostedSignal {
    pub(crate) signal: ApprovalSignal,
    pub(crate) observed: CyclePhase,
}

struct ActiveRun {
    status: watch::Receiver<CycleState>,
    approvals: mpsc::UnboundedSender<HostedSignal>,
    cancel: Arc<watch::Sender<bool>>,
}

pub(crate) struct Inner {
    pub(crate) agents: AgentSet,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) domain: Arc<dyn DomainStore>,
    pub(crate) lease: LeaseConfig,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl Inner {
    pub(crate) fn lease_until(&self) -> DateTime<Utc> {
        self.lease.expiry_from(Utc::now())
    }

    fn active(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveRun>>> {
        self.active
            .lock()
            .map_err(|_| RepairError::TaskAborted("active run table poisoned".into()))
    }

    fn release(&self, run_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(run_id);
        }
    }
}

/// Removes a run from the active table when its task ends, even on panic.
struct ActiveGuard {
    inner: Arc<Inner>,
    run_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.release(&self.run_id);
    }
}

/// Starts, hosts and answers for repair cycles.
#[derive(Clone)]
pub struct RepairOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RepairOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairOrchestrator").finish_non_exhaustive()
    }
}

impl RepairOrchestrator {
    pub fn new(agents: AgentSet, store: Arc<dyn StateStore>, domain: Arc<dyn DomainStore>) -> Self {
        Self::with_lease(agents, store, domain, LeaseConfig::default())
    }

    pub fn with_lease(
        agents: AgentSet,
        store: Arc<dyn StateStore>,
        domain: Arc<dyn DomainStore>,
        lease: LeaseConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agents,
                store,
                domain,
                lease,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Host id this process writes into the leases it holds.
    pub fn host_id(&self) -> &str {
        &self.inner.lease.host_id
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn domain(&self) -> Arc<dyn DomainStore> {
        Arc::clone(&self.inner.domain)
    }

    /// Run ids hosted by this process.
    pub fn active_runs(&self) -> Vec<String> {
        self.inner
            .active()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Begin a new cycle in DETECTING-PROBLEMS.
    ///
    /// Fails with [`RepairError::DuplicateRun`] if `run_id` is hosted here or
    /// has an unfinished record in the store.
    pub async fn start(
        &self,
        run_id: impl Into<String>,
        config: CycleConfig,
        correlation_id: Option<String>,
    ) -> Result<RunHandle> {
        config.validate()?;
        let run_id = run_id.into();
        let state = CycleState::new(run_id.clone(), correlation_id, config);
        let slot = self.reserve(&state, false)?;

        let created = match cycle_record(&state) {
            Ok(record) => {
                let record = record.with_lease(self.inner.lease.host_id.clone(), self.inner.lease_until());
                self.inner.store.create_cycle(record).await.map_err(RepairError::from)
            }
            Err(e) => Err(e),
        };
        let version = match created {
            Ok(stored) => stored.version,
            Err(e) => {
                self.inner.release(&run_id);
                return Err(e);
            }
        };
        info!(run_id = %run_id, host = %self.inner.lease.host_id, "cycle accepted");
        Ok(self.spawn(state, slot, version, false))
    }

    /// Continue a persisted, unfinished cycle from its recorded phase.
    ///
    /// Fails with [`RepairError::DuplicateRun`] while another host holds a
    /// live lease on the run.
    pub async fn resume(&self, run_id: &str) -> Result<RunHandle> {
        let state = self.load_state(run_id).await?;
        if state.is_terminal() {
            return Err(RepairError::RunFinished {
                run_id: run_id.to_string(),
                phase: state.phase.to_string(),
            });
        }
        let slot = self.reserve(&state, false)?;
        match self.claim(run_id).await {
            Ok((state, version)) => {
                slot.status_tx.send_replace(state.clone());
                info!(run_id = %run_id, phase = %state.phase, "cycle claimed for resume");
                Ok(self.spawn(state, slot, version, true))
            }
            Err(e) => {
                self.inner.release(run_id);
                Err(e.into())
            }
        }
    }

    /// Ask a run to stop.
    ///
    /// A hosted run observes the request at its next suspension point. A run
    /// hosted by another live process gets the request in its inbox and
    /// picks it up on its next heartbeat. An unfinished run nobody holds is
    /// taken over and wound down to CANCELLED here.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        {
            let active = self.inner.active()?;
            if let Some(run) = active.get(run_id) {
                run.cancel.send_replace(true);
                return Ok(());
            }
        }
        let state = self.load_state(run_id).await?;
        if state.is_terminal() {
            return Err(RepairError::RunFinished {
                run_id: run_id.to_string(),
                phase: state.phase.to_string(),
            });
        }
        let slot = self.reserve(&state, true)?;
        match self.claim(run_id).await {
            Ok((state, version)) => {
                slot.status_tx.send_replace(state.clone());
                self.spawn(state, slot, version, true).wait().await.map(|_| ())
            }
            Err(StorageError::LeaseHeld { owner, .. }) => {
                self.inner.release(run_id);
                self.inner
                    .store
                    .put_signal(SignalRecord::new(run_id, CANCEL_SIGNAL_KIND, serde_json::Value::Null))
                    .await?;
                info!(run_id = %run_id, owner = %owner, "cancel request queued for hosting process");
                Ok(())
            }
            Err(e) => {
                self.inner.release(run_id);
                Err(e.into())
            }
        }
    }

    /// Status of a run; live for hosted runs, from the store otherwise.
    pub async fn query_status(&self, run_id: &str) -> Result<CycleStatus> {
        if let Some(state) = self.live_state(run_id)? {
            return Ok(CycleStatus::from_state(&state, true));
        }
        let mut state = self.load_state(run_id).await?;
        if state.phase != CyclePhase::PendingApproval {
            // Inbox signals a host has not drained yet can only be ignored.
            for record in self.inner.store.list_signals(run_id, APPROVAL_SIGNAL_KIND).await? {
                if let Some(signal) = runner::decode_signal(&record) {
                    state.ignored_signals.push(IgnoredSignal {
                        signal,
                        phase: state.phase,
                        received_at: record.received_at,
                    });
                }
            }
        }
        Ok(CycleStatus::from_state(&state, false))
    }

    /// The run's current plan, if one has been computed.
    pub async fn describe_plan(&self, run_id: &str) -> Result<Option<RepairPlan>> {
        Ok(self.query_status(run_id).await?.plan)
    }

    pub async fn report(&self, run_id: &str) -> Result<Option<CycleReport>> {
        Ok(self.query_status(run_id).await?.report)
    }

    /// Cycles in the store, newest first.
    pub async fn list_cycles(&self, filter: &CycleFilter) -> Result<Vec<CycleStatus>> {
        let records = self.inner.store.list_cycles(filter).await?;
        let hosted = self.active_runs();
        records
            .into_iter()
            .map(|record| -> Result<CycleStatus> {
                let state: CycleState = serde_json::from_value(record.state)?;
                let active = hosted.contains(&state.run_id);
                Ok(CycleStatus::from_state(&state, active))
            })
            .collect()
    }

    /// Deliver an approve/reject decision.
    ///
    /// Only a run in PENDING-APPROVAL acts on it. A run hosted elsewhere gets
    /// the signal through its durable inbox; the cycle record itself is only
    /// ever written by the lease holder. Anywhere but PENDING-APPROVAL the
    /// signal ends up recorded as ignored and `Ignored` is returned.
    pub async fn signal_approval(&self, run_id: &str, signal: ApprovalSignal) -> Result<SignalDelivery> {
        {
            let active = self.inner.active()?;
            if let Some(run) = active.get(run_id) {
                let observed = run.status.borrow().phase;
                // The runner records signals it cannot use as ignored.
                let _ = run.approvals.send(HostedSignal { signal, observed });
                return Ok(if observed == CyclePhase::PendingApproval {
                    SignalDelivery::Delivered
                } else {
                    SignalDelivery::Ignored { phase: observed }
                });
            }
        }

        let state = self.load_state(run_id).await?;
        let payload = serde_json::to_value(&signal)?;
        self.inner
            .store
            .put_signal(SignalRecord::new(run_id, APPROVAL_SIGNAL_KIND, payload))
            .await?;
        if state.phase == CyclePhase::PendingApproval {
            info!(run_id = %run_id, "approval signal queued for inactive run");
            return Ok(SignalDelivery::Queued);
        }

        let phase = state.phase;
        METRICS.inc_signals_ignored();
        obs::emit_signal_ignored(run_id, phase);
        Ok(SignalDelivery::Ignored { phase })
    }

    fn live_state(&self, run_id: &str) -> Result<Option<CycleState>> {
        let active = self.inner.active()?;
        Ok(active.get(run_id).map(|run| run.status.borrow().clone()))
    }

    async fn load_state(&self, run_id: &str) -> Result<CycleState> {
        let record = self.inner.store.load_cycle(run_id).await?;
        Ok(serde_json::from_value(record.state)?)
    }

    /// Take the run's lease for this process. Returns the claimed state and
    /// the version the next write must carry.
    async fn claim(&self, run_id: &str) -> std::result::Result<(CycleState, u64), StorageError> {
        let now = Utc::now();
        let record = self
            .inner
            .store
            .claim_cycle(run_id, &self.inner.lease.host_id, now, self.inner.lease.expiry_from(now))
            .await?;
        record.verify()?;
        let state: CycleState = serde_json::from_value(record.state)?;
        Ok((state, record.version))
    }

    /// Claim `state.run_id` in the active table and build the run's channels.
    fn reserve(&self, state: &CycleState, cancelled: bool) -> Result<RunSlot> {
        let (status_tx, status_rx) = watch::channel(state.clone());
        let (approvals_tx, approvals_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(cancelled);
        let cancel_tx = Arc::new(cancel_tx);

        let mut active = self.inner.active()?;
        if active.contains_key(&state.run_id) {
            return Err(RepairError::DuplicateRun {
                run_id: state.run_id.clone(),
            });
        }
        active.insert(
            state.run_id.clone(),
            ActiveRun {
                status: status_rx.clone(),
                approvals: approvals_tx,
                cancel: Arc::clone(&cancel_tx),
            },
        );
        Ok(RunSlot {
            status_tx,
            status_rx,
            approvals_rx,
            cancel_tx,
            cancel_rx,
        })
    }

    fn spawn(&self, state: CycleState, slot: RunSlot, version: u64, resumed: bool) -> RunHandle {
        let run_id = state.run_id.clone();
        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            run_id: run_id.clone(),
        };
        let runner = CycleRunner::new(
            Arc::clone(&self.inner),
            state,
            slot.status_tx,
            slot.approvals_rx,
            slot.cancel_tx,
            slot.cancel_rx,
            version,
            resumed,
        );
        let span = obs::cycle_span(&run_id);
        let join = tokio::spawn(
            async move {
                let _guard = guard;
                runner.run().await
            }
            .instrument(span),
        );
        RunHandle {
            run_id,
            status: slot.status_rx,
            join,
        }
    }
}

struct RunSlot {
    status_tx: watch::Sender<CycleState>,
    status_rx: watch::Receiver<CycleState>,
    approvals_rx: mpsc::UnboundedReceiver<HostedSignal>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

fn cycle_record(state: &CycleState) -> Result<CycleRecord> {
    Ok(CycleRecord::new(
        state.run_id.clone(),
        state.correlation_id.clone(),
        state.phase.as_str(),
        state.is_terminal(),
        serde_json::to_value(state)?,
    )?)
}

/// Write `state` as the run's latest durable snapshot, as lease holder of
/// `version`. Returns the version the next write must carry.
pub(crate) async fn persist(inner: &Inner, state: &CycleState, version: u64) -> Result<u64> {
    let record = cycle_record(state)?
        .with_lease(inner.lease.host_id.clone(), inner.lease_until())
        .with_version(version);
    match inner.store.save_cycle(record).await {
        Ok(stored) => Ok(stored.version),
        Err(
            e @ (StorageError::LeaseHeld { .. }
            | StorageError::StaleWrite { .. }
            | StorageError::CycleFinished { .. }),
        ) => {
            warn!(run_id = %state.run_id, error = %e, "cycle write refused");
            Err(RepairError::LeaseLost {
                run_id: state.run_id.clone(),
                reason: e.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}
