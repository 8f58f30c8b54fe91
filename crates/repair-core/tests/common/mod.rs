//! Scripted agents and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use tokio::sync::Notify;

use repair_core::domain::DEFAULT_APPROVER;
use repair_core::{
    AgentError, AgentResult, AgentSet, AnalysisAgent, CycleConfig, Detection, DetectionAgent,
    Diagnosis, DomainSnapshot, LeaseConfig, MemoryDomainStore, MemoryStateStore, Notifier, Order,
    PlanningAgent, ProblemNotification, ProblemUnit, RepairAction, RepairOrchestrator,
    RepairPlan, RepairTool, RetryPolicy, SummaryReporter,
};

pub fn order(id: &str) -> Order {
    Order {
        order_id: id.to_string(),
        order_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        status: "pending-approval".to_string(),
        customer_name: "Hermione Granger".to_string(),
        customer_id: "C-1".to_string(),
        payment_method: "card".to_string(),
        items: vec![],
    }
}

pub fn unit_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("O-{i}")).collect()
}

pub fn snapshot(n: usize) -> DomainSnapshot {
    DomainSnapshot {
        orders: unit_ids(n).iter().map(|id| order(id)).collect(),
        inventory: vec![],
    }
}

/// Fast cycle config: no backoff waits worth mentioning, inbox polling on.
pub fn fast_config() -> CycleConfig {
    CycleConfig {
        action_retry: RetryPolicy::bounded(3, Duration::from_millis(1)),
        agent_retry: RetryPolicy::bounded(3, Duration::from_millis(1)),
        signal_poll_interval: Some(Duration::from_millis(10)),
        ..CycleConfig::default()
    }
}

// ── Scripted agents ──

/// Reports `units` with `confidence`, after returning any scripted errors.
pub struct ScriptedDetector {
    pub confidence: f64,
    pub units: Vec<ProblemUnit>,
    pub errors: Mutex<VecDeque<AgentError>>,
    pub calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(confidence: f64, ids: &[String]) -> Self {
        Self {
            confidence,
            units: ids
                .iter()
                .map(|id| ProblemUnit::for_order(id, "needs approval"))
                .collect(),
            errors: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the first calls with `errors`, in order.
    pub fn failing_first(mut self, errors: Vec<AgentError>) -> Self {
        self.errors = Mutex::new(errors.into());
        self
    }
}

#[async_trait]
impl DetectionAgent for ScriptedDetector {
    async fn detect(&self, _snapshot: &DomainSnapshot) -> AgentResult<Detection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(Detection {
            confidence: self.confidence,
            units: self.units.clone(),
            notes: None,
        })
    }
}

/// Diagnoses every unit, except ids listed in `malformed` which always
/// produce malformed output. With `hold` set, each call first waits for a
/// permit on it.
pub struct ScriptedAnalyzer {
    pub malformed: Vec<String>,
    pub hold: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self {
            malformed: vec![],
            hold: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_for(ids: &[&str]) -> Self {
        Self {
            malformed: ids.iter().map(|s| s.to_string()).collect(),
            hold: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn held(gate: Arc<Notify>) -> Self {
        Self {
            malformed: vec![],
            hold: Some(gate),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnalysisAgent for ScriptedAnalyzer {
    async fn analyze(&self, unit: &ProblemUnit, _snapshot: &DomainSnapshot) -> AgentResult<Diagnosis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.hold {
            gate.notified().await;
        }
        if self.malformed.contains(&unit.unit_id) {
            return Err(AgentError::Malformed("not json".into()));
        }
        Ok(Diagnosis {
            unit_id: unit.unit_id.clone(),
            findings: json!({"issue_kind": "needs_approval"}),
            confidence: 0.9,
        })
    }
}

/// Proposes one approval request per diagnosed unit, taking confidences in
/// order (the last one repeats).
pub struct ScriptedPlanner {
    pub confidences: Vec<f64>,
    pub malformed: bool,
    pub calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new(confidences: &[f64]) -> Self {
        Self {
            confidences: confidences.to_vec(),
            malformed: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn malformed() -> Self {
        Self {
            confidences: vec![],
            malformed: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PlanningAgent for ScriptedPlanner {
    async fn plan(&self, diagnoses: &[Diagnosis], _snapshot: &DomainSnapshot) -> AgentResult<RepairPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.malformed {
            return Err(AgentError::Malformed("plan is not a unit map".into()));
        }
        let mut plan = RepairPlan::new();
        for (i, diagnosis) in diagnoses.iter().enumerate() {
            let confidence = self
                .confidences
                .get(i)
                .or(self.confidences.last())
                .copied()
                .unwrap_or(1.0);
            let tool = RepairTool::RequestApproval {
                approver: DEFAULT_APPROVER.to_string(),
                approval_request_contents: format!("please approve {}", diagnosis.unit_id),
                order_id: diagnosis.unit_id.clone(),
            };
            let action = RepairAction::new(&diagnosis.unit_id, tool, confidence)
                .map_err(|e| AgentError::Malformed(e.to_string()))?;
            plan.add_action(action);
        }
        Ok(plan)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<ProblemNotification>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &ProblemNotification) -> repair_core::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ── Harness ──

pub struct Harness {
    pub orchestrator: RepairOrchestrator,
    pub store: Arc<MemoryStateStore>,
    pub domain: Arc<MemoryDomainStore>,
    pub detector: Arc<ScriptedDetector>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub planner: Arc<ScriptedPlanner>,
}

impl Harness {
    /// `units` problem orders, planned with `confidences`.
    pub fn new(units: usize, confidences: &[f64]) -> Self {
        Self::build(
            ScriptedDetector::new(0.9, &unit_ids(units)),
            ScriptedAnalyzer::new(),
            ScriptedPlanner::new(confidences),
            units,
        )
    }

    pub fn build(
        detector: ScriptedDetector,
        analyzer: ScriptedAnalyzer,
        planner: ScriptedPlanner,
        orders: usize,
    ) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let domain = Arc::new(MemoryDomainStore::new(snapshot(orders)));
        Self::with_stores(detector, analyzer, planner, store, domain)
    }

    pub fn with_stores(
        detector: ScriptedDetector,
        analyzer: ScriptedAnalyzer,
        planner: ScriptedPlanner,
        store: Arc<MemoryStateStore>,
        domain: Arc<MemoryDomainStore>,
    ) -> Self {
        let detector = Arc::new(detector);
        let analyzer = Arc::new(analyzer);
        let planner = Arc::new(planner);
        let agents = AgentSet::new(
            detector.clone(),
            analyzer.clone(),
            planner.clone(),
            Arc::new(SummaryReporter),
        );
        let orchestrator = RepairOrchestrator::new(agents, store.clone(), domain.clone());
        Self {
            orchestrator,
            store,
            domain,
            detector,
            analyzer,
            planner,
        }
    }
}

impl Harness {
    /// Another host over the same stores and agents.
    pub fn peer(&self, lease: LeaseConfig) -> RepairOrchestrator {
        let agents = AgentSet::new(
            self.detector.clone(),
            self.analyzer.clone(),
            self.planner.clone(),
            Arc::new(SummaryReporter),
        );
        RepairOrchestrator::with_lease(agents, self.store.clone(), self.domain.clone(), lease)
    }
}

pub fn lease(host_id: &str, ttl: Duration) -> LeaseConfig {
    LeaseConfig {
        host_id: host_id.to_string(),
        ttl,
    }
}
