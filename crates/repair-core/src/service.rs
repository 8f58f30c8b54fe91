//! Operations exposed to external callers (tool servers, CLIs, HTTP shims).
//!
//! Every response is a plain serde struct so the transport can be chosen by
//! the caller.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::{CycleConfig, LoopConfig};
use crate::domain::{
    ApprovalSignal, CyclePhase, CycleReport, DomainSnapshot, RepairError, RepairPlan, Result,
};
use crate::notify::NotificationTarget;
use crate::orchestrator::{CycleStatus, RepairOrchestrator, SignalDelivery};
use crate::proactive::{LoopHandle, LoopStatus, ProactiveLoop};

/// Returned when a cycle or loop is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub phase: CyclePhase,
    pub proactive: bool,
}

/// Returned for approve/reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResponse {
    pub run_id: String,
    #[serde(flatten)]
    pub delivery: SignalDelivery,
    pub current_phase: CyclePhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceResponse {
    pub run_id: String,
    /// Detection confidence as a percentage; `None` before detection finished.
    pub problems_confidence_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub run_id: String,
    pub phase: CyclePhase,
    pub plan: Option<RepairPlan>,
    pub plan_error: Option<String>,
}

/// Returned for loop controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopResponse {
    pub correlation_id: String,
    pub phase: CyclePhase,
    pub iteration: u32,
    pub exit_requested: bool,
    pub finished: bool,
}

impl From<&LoopStatus> for LoopResponse {
    fn from(status: &LoopStatus) -> Self {
        Self {
            correlation_id: status.correlation_id.clone(),
            phase: status.phase,
            iteration: status.iteration,
            exit_requested: status.exit_requested,
            finished: status.finished,
        }
    }
}

/// Facade over the orchestrator and the proactive loops it hosts.
pub struct RepairService {
    orchestrator: RepairOrchestrator,
    user: String,
    cycle: CycleConfig,
    loop_config: LoopConfig,
    loops: Mutex<HashMap<String, LoopHandle>>,
}

impl std::fmt::Debug for RepairService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairService")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl RepairService {
    pub fn new(orchestrator: RepairOrchestrator, user: impl Into<String>) -> Self {
        Self {
            orchestrator,
            user: user.into(),
            cycle: CycleConfig::default(),
            loop_config: LoopConfig::default(),
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cycle_config(mut self, cycle: CycleConfig) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn orchestrator(&self) -> &RepairOrchestrator {
        &self.orchestrator
    }

    /// Start a one-shot cycle.
    pub async fn initiate_repair(&self) -> Result<InitiateResponse> {
        let run_id = format!("repair-{}-{}", self.user, Uuid::new_v4());
        let handle = self.orchestrator.start(&run_id, self.cycle.clone(), None).await?;
        let phase = handle.status().phase;
        info!(run_id = %run_id, user = %self.user, "repair initiated");
        Ok(InitiateResponse {
            run_id,
            correlation_id: None,
            phase,
            proactive: false,
        })
    }

    /// Start a proactive loop. `callback` overrides the configured notification target.
    pub async fn initiate_proactive(&self, callback: Option<NotificationTarget>) -> Result<InitiateResponse> {
        let correlation_id = format!("proactive-{}-{}", self.user, Uuid::new_v4());
        let mut config = self.loop_config.clone();
        if callback.is_some() {
            config.notification = callback;
        }
        let handle = ProactiveLoop::new(
            self.orchestrator.clone(),
            correlation_id.clone(),
            self.cycle.clone(),
            config,
        )?
        .spawn();
        let phase = handle.status().phase;
        self.loops()?.insert(correlation_id.clone(), handle);
        info!(correlation_id = %correlation_id, user = %self.user, "proactive loop initiated");
        Ok(InitiateResponse {
            run_id: format!("{correlation_id}-cycle-1"),
            correlation_id: Some(correlation_id),
            phase,
            proactive: true,
        })
    }

    pub async fn approve(&self, run_id: &str, actor: Option<String>, note: Option<String>) -> Result<SignalResponse> {
        let actor = actor.unwrap_or_else(|| self.user.clone());
        self.signal(run_id, ApprovalSignal::approve(Some(actor), note)).await
    }

    pub async fn reject(&self, run_id: &str, actor: Option<String>, note: Option<String>) -> Result<SignalResponse> {
        let actor = actor.unwrap_or_else(|| self.user.clone());
        self.signal(run_id, ApprovalSignal::reject(Some(actor), note)).await
    }

    async fn signal(&self, run_id: &str, signal: ApprovalSignal) -> Result<SignalResponse> {
        let delivery = self.orchestrator.signal_approval(run_id, signal).await?;
        let current_phase = self.orchestrator.query_status(run_id).await?.phase;
        Ok(SignalResponse {
            run_id: run_id.to_string(),
            delivery,
            current_phase,
        })
    }

    pub async fn status(&self, run_id: &str) -> Result<CycleStatus> {
        self.orchestrator.query_status(run_id).await
    }

    pub async fn problems_confidence(&self, run_id: &str) -> Result<ConfidenceResponse> {
        let status = self.orchestrator.query_status(run_id).await?;
        Ok(ConfidenceResponse {
            run_id: run_id.to_string(),
            problems_confidence_percent: status.detection_confidence.map(|c| c * 100.0),
        })
    }

    pub async fn describe_plan(&self, run_id: &str) -> Result<PlanResponse> {
        let status = self.orchestrator.query_status(run_id).await?;
        Ok(PlanResponse {
            run_id: run_id.to_string(),
            phase: status.phase,
            plan: status.plan,
            plan_error: status.plan_error,
        })
    }

    pub async fn report(&self, run_id: &str) -> Result<Option<CycleReport>> {
        self.orchestrator.report(run_id).await
    }

    /// Current orders and inventory.
    pub async fn get_orders(&self) -> Result<DomainSnapshot> {
        Ok(self.orchestrator.domain().snapshot().await?)
    }

    pub fn loop_status(&self, correlation_id: &str) -> Result<LoopStatus> {
        self.with_loop(correlation_id, |handle| Ok(handle.status()))
    }

    pub fn request_exit(&self, correlation_id: &str) -> Result<LoopResponse> {
        self.with_loop(correlation_id, |handle| {
            handle.request_exit()?;
            Ok(LoopResponse::from(&handle.status()))
        })
    }

    pub fn stop_waiting(&self, correlation_id: &str) -> Result<LoopResponse> {
        self.with_loop(correlation_id, |handle| {
            handle.stop_waiting()?;
            Ok(LoopResponse::from(&handle.status()))
        })
    }

    /// Correlation ids of loops started through this service.
    pub fn loops_started(&self) -> Vec<String> {
        self.loops()
            .map(|loops| loops.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn with_loop<T>(&self, correlation_id: &str, f: impl FnOnce(&LoopHandle) -> Result<T>) -> Result<T> {
        let loops = self.loops()?;
        let handle = loops.get(correlation_id).ok_or_else(|| RepairError::LoopNotFound {
            correlation_id: correlation_id.to_string(),
        })?;
        f(handle)
    }

    fn loops(&self) -> Result<MutexGuard<'_, HashMap<String, LoopHandle>>> {
        self.loops
            .lock()
            .map_err(|_| RepairError::TaskAborted("loop table poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::agents::AgentSet;
    use crate::config::RuleConfig;
    use crate::domain_store::MemoryDomainStore;
    use repair_state::MemoryStateStore;

    fn service() -> RepairService {
        let orchestrator = RepairOrchestrator::new(
            AgentSet::rule_based(RuleConfig::default()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryDomainStore::new(DomainSnapshot::default())),
        );
        RepairService::new(orchestrator, "tester")
    }

    #[tokio::test]
    async fn test_unknown_loop() {
        let svc = service();
        let err = svc.request_exit("missing").unwrap_err();
        assert!(matches!(err, RepairError::LoopNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let svc = service();
        let err = svc.status("missing").await.unwrap_err();
        assert!(matches!(err, RepairError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_initiate_repair_names_run_after_user() {
        let svc = service();
        let resp = svc.initiate_repair().await.unwrap();
        assert!(resp.run_id.starts_with("repair-tester-"));
        assert!(!resp.proactive);
    }

    #[test]
    fn test_signal_response_wire_format() {
        let resp = SignalResponse {
            run_id: "r".into(),
            delivery: SignalDelivery::Ignored {
                phase: CyclePhase::ReportCompleted,
            },
            current_phase: CyclePhase::ReportCompleted,
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["delivery"], "ignored");
        assert_eq!(v["phase"], "REPORT-COMPLETED");
        assert_eq!(v["current_phase"], "REPORT-COMPLETED");
    }
}
