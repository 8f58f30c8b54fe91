//! Collaborator contracts for the four reasoning stages.
//!
//! Agents are replaceable: the orchestrator only relies on these traits and
//! on [`AgentError`] to decide between retrying, skipping and failing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RuleConfig;
use crate::domain::{
    AgentResult, CycleReport, Detection, Diagnosis, DomainSnapshot, ProblemUnit, RepairPlan,
};
use crate::heuristics::{RuleAnalyzer, RuleDetector, RulePlanner, SummaryReporter};

/// Finds problem units in the domain.
#[async_trait]
pub trait DetectionAgent: Send + Sync {
    async fn detect(&self, snapshot: &DomainSnapshot) -> AgentResult<Detection>;
}

/// Diagnoses a single unit.
///
/// Output is validated by the orchestrator; [`crate::domain::AgentError::Malformed`]
/// makes it ask again, up to `analysis_max_attempts` times.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    async fn analyze(&self, unit: &ProblemUnit, snapshot: &DomainSnapshot) -> AgentResult<Diagnosis>;
}

/// Proposes repair actions for the cycle's diagnoses.
#[async_trait]
pub trait PlanningAgent: Send + Sync {
    async fn plan(&self, diagnoses: &[Diagnosis], snapshot: &DomainSnapshot) -> AgentResult<RepairPlan>;
}

/// Writes the narrative summary of a tallied report.
#[async_trait]
pub trait ReportingAgent: Send + Sync {
    async fn summarize(&self, report: &CycleReport) -> AgentResult<String>;
}

/// The agents a cycle runs with.
#[derive(Clone)]
pub struct AgentSet {
    pub detector: Arc<dyn DetectionAgent>,
    pub analyzer: Arc<dyn AnalysisAgent>,
    pub planner: Arc<dyn PlanningAgent>,
    pub reporter: Arc<dyn ReportingAgent>,
}

impl AgentSet {
    pub fn new(
        detector: Arc<dyn DetectionAgent>,
        analyzer: Arc<dyn AnalysisAgent>,
        planner: Arc<dyn PlanningAgent>,
        reporter: Arc<dyn ReportingAgent>,
    ) -> Self {
        Self {
            detector,
            analyzer,
            planner,
            reporter,
        }
    }

    /// Deterministic rule-based agents for orders and inventory.
    pub fn rule_based(rules: RuleConfig) -> Self {
        Self {
            detector: Arc::new(RuleDetector::new(rules.clone())),
            analyzer: Arc::new(RuleAnalyzer::new(rules.clone())),
            planner: Arc::new(RulePlanner::new(rules)),
            reporter: Arc::new(SummaryReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ReportingAgent>) -> Self {
        self.reporter = reporter;
        self
    }
}

impl std::fmt::Debug for AgentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSet").finish_non_exhaustive()
    }
}
