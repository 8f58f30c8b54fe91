//! Cycle phases and the durable per-cycle state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::action::{ActionOutcome, RepairAction};
use super::plan::RepairPlan;
use super::problem::{Detection, Diagnosis, ProblemUnit, SkippedUnit};
use super::report::CycleReport;
use crate::config::CycleConfig;

/// Externally visible phase of a cycle (or of a proactive loop between cycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum CyclePhase {
    DetectingProblems,
    PlanningRepair,
    PendingApproval,
    PendingRepair,
    PendingReport,
    ReportCompleted,
    Cancelled,
    CompletedNoAction,
    WaitingForNextCycle,
}

impl CyclePhase {
    pub const ALL: [CyclePhase; 9] = [
        Self::DetectingProblems,
        Self::PlanningRepair,
        Self::PendingApproval,
        Self::PendingRepair,
        Self::PendingReport,
        Self::ReportCompleted,
        Self::Cancelled,
        Self::CompletedNoAction,
        Self::WaitingForNextCycle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DetectingProblems => "DETECTING-PROBLEMS",
            Self::PlanningRepair => "PLANNING-REPAIR",
            Self::PendingApproval => "PENDING-APPROVAL",
            Self::PendingRepair => "PENDING-REPAIR",
            Self::PendingReport => "PENDING-REPORT",
            Self::ReportCompleted => "REPORT-COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::CompletedNoAction => "COMPLETED-NO-ACTION",
            Self::WaitingForNextCycle => "WAITING-FOR-NEXT-CYCLE",
        }
    }

    /// A cycle in a terminal phase never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ReportCompleted | Self::Cancelled | Self::CompletedNoAction
        )
    }

    /// Position in the forward order. Transitions within a cycle strictly increase it;
    /// all terminal phases share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::DetectingProblems => 0,
            Self::PlanningRepair => 1,
            Self::PendingApproval => 2,
            Self::PendingRepair => 3,
            Self::PendingReport => 4,
            Self::ReportCompleted | Self::Cancelled | Self::CompletedNoAction => 5,
            Self::WaitingForNextCycle => 6,
        }
    }

    /// Whether a cycle may move from `self` to `next`.
    pub fn can_advance_to(&self, next: CyclePhase) -> bool {
        !self.is_terminal() && next != Self::WaitingForNextCycle && next.rank() > self.rank()
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CyclePhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// One entry of a cycle's phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: CyclePhase,
    pub at: DateTime<Utc>,
}

/// How the approval gate resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
    Approved,
    Rejected,
    AutoApproved,
}

impl ApprovalVerdict {
    pub fn allows_proceed(&self) -> bool {
        matches!(self, Self::Approved | Self::AutoApproved)
    }
}

impl fmt::Display for ApprovalVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::AutoApproved => "auto_approved",
        })
    }
}

/// The single approval decision of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub verdict: ApprovalVerdict,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// What an external approver asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDecision {
    Approve,
    Reject,
}

/// An approval signal addressed to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSignal {
    pub decision: SignalDecision,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ApprovalSignal {
    pub fn approve(actor: Option<String>, note: Option<String>) -> Self {
        Self {
            decision: SignalDecision::Approve,
            actor,
            note,
        }
    }

    pub fn reject(actor: Option<String>, note: Option<String>) -> Self {
        Self {
            decision: SignalDecision::Reject,
            actor,
            note,
        }
    }
}

/// A signal that arrived outside PENDING-APPROVAL and had no effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoredSignal {
    pub signal: ApprovalSignal,
    pub phase: CyclePhase,
    pub received_at: DateTime<Utc>,
}

/// Full durable state of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub run_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub phase: CyclePhase,
    pub history: Vec<PhaseTransition>,
    pub config: CycleConfig,
    #[serde(default)]
    pub detection: Option<Detection>,
    #[serde(default)]
    pub units: Vec<ProblemUnit>,
    #[serde(default)]
    pub diagnoses: Vec<Diagnosis>,
    /// Units analysis could not diagnose.
    #[serde(default)]
    pub analysis_skips: Vec<SkippedUnit>,
    #[serde(default)]
    pub plan: Option<RepairPlan>,
    /// Set when the planner's output failed validation.
    #[serde(default)]
    pub plan_error: Option<String>,
    /// Outcome per action id.
    #[serde(default)]
    pub outcomes: BTreeMap<String, ActionOutcome>,
    #[serde(default)]
    pub approval: Option<ApprovalDecision>,
    #[serde(default)]
    pub approval_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ignored_signals: Vec<IgnoredSignal>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub report: Option<CycleReport>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CycleState {
    /// Fresh state in DETECTING-PROBLEMS.
    pub fn new(run_id: impl Into<String>, correlation_id: Option<String>, config: CycleConfig) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            correlation_id,
            phase: CyclePhase::DetectingProblems,
            history: vec![PhaseTransition {
                phase: CyclePhase::DetectingProblems,
                at: now,
            }],
            config,
            detection: None,
            units: Vec::new(),
            diagnoses: Vec::new(),
            analysis_skips: Vec::new(),
            plan: None,
            plan_error: None,
            outcomes: BTreeMap::new(),
            approval: None,
            approval_deadline: None,
            ignored_signals: Vec::new(),
            cancel_reason: None,
            report: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Phases visited so far, oldest first.
    pub fn phases(&self) -> Vec<CyclePhase> {
        self.history.iter().map(|t| t.phase).collect()
    }

    pub fn detection_confidence(&self) -> Option<f64> {
        self.detection.as_ref().map(|d| d.confidence)
    }

    pub fn outcome(&self, action_id: &str) -> Option<&ActionOutcome> {
        self.outcomes.get(action_id)
    }

    /// Planned actions whose outcome is still pending.
    pub fn pending_actions(&self) -> Vec<RepairAction> {
        let Some(plan) = &self.plan else {
            return Vec::new();
        };
        plan.all_actions()
            .filter(|a| {
                matches!(
                    self.outcomes.get(a.action_id.as_str()),
                    None | Some(ActionOutcome::Pending)
                )
            })
            .cloned()
            .collect()
    }

    /// Mark every unresolved action skipped with `reason`; returns how many changed.
    pub fn skip_pending(&mut self, reason: &str) -> usize {
        let pending: Vec<String> = self
            .pending_actions()
            .into_iter()
            .map(|a| a.action_id.as_str().to_string())
            .collect();
        for id in &pending {
            self.outcomes.insert(
                id.clone(),
                ActionOutcome::Skipped {
                    reason: reason.to_string(),
                },
            );
        }
        pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_strings_round_trip_through_serde() {
        for phase in CyclePhase::ALL {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, serde_json::Value::String(phase.as_str().to_string()));
            assert_eq!(phase.as_str().parse::<CyclePhase>().unwrap(), phase);
        }
    }

    #[test]
    fn test_forward_only_transitions() {
        use CyclePhase::*;
        assert!(DetectingProblems.can_advance_to(PlanningRepair));
        assert!(DetectingProblems.can_advance_to(CompletedNoAction));
        assert!(PlanningRepair.can_advance_to(PendingRepair));
        assert!(PlanningRepair.can_advance_to(PendingReport));
        assert!(PendingApproval.can_advance_to(Cancelled));
        assert!(!PendingRepair.can_advance_to(PendingApproval));
        assert!(!Cancelled.can_advance_to(PendingReport));
        assert!(!PendingReport.can_advance_to(WaitingForNextCycle));
    }

    #[test]
    fn test_new_state_starts_detecting() {
        let state = CycleState::new("r-1", None, CycleConfig::default());
        assert_eq!(state.phase, CyclePhase::DetectingProblems);
        assert_eq!(state.phases(), vec![CyclePhase::DetectingProblems]);
        assert!(state.pending_actions().is_empty());
    }

    #[test]
    fn test_unknown_phase_string() {
        assert!("ANALYZING".parse::<CyclePhase>().is_err());
    }
}
