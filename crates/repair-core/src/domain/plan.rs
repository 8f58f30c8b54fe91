//! Repair plans proposed by the planning agent.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::action::RepairAction;
use super::error::{RepairError, Result};
use super::problem::{is_confidence, Diagnosis, SkippedUnit};

/// Reason recorded for a diagnosed unit the planner proposed nothing for.
pub const NO_ACTION_PROPOSED: &str = "no action proposed";

/// Unit id to proposed actions, plus units explicitly skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub actions: BTreeMap<String, Vec<RepairAction>>,
    #[serde(default)]
    pub skipped: Vec<SkippedUnit>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RepairPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_action(&mut self, action: RepairAction) {
        self.actions
            .entry(action.unit_id.clone())
            .or_default()
            .push(action);
    }

    pub fn skip(&mut self, unit_id: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(SkippedUnit::new(unit_id, reason));
    }

    /// All actions in unit order.
    pub fn all_actions(&self) -> impl Iterator<Item = &RepairAction> {
        self.actions.values().flatten()
    }

    pub fn action_count(&self) -> usize {
        self.actions.values().map(Vec::len).sum()
    }

    /// The weakest action confidence; `None` for an empty plan.
    pub fn min_confidence(&self) -> Option<f64> {
        self.all_actions().map(|a| a.confidence).reduce(f64::min)
    }

    pub fn find_action(&self, action_id: &str) -> Option<&RepairAction> {
        self.all_actions().find(|a| a.action_id.as_str() == action_id)
    }

    pub fn is_skipped(&self, unit_id: &str) -> bool {
        self.skipped.iter().any(|s| s.unit_id == unit_id)
    }

    /// Check the plan against the cycle's diagnoses.
    ///
    /// Every action must reference a diagnosed unit, sit under that unit's
    /// key, carry a confidence in [0, 1] and a matching identity.
    pub fn validate(&self, diagnoses: &[Diagnosis]) -> Result<()> {
        let known: HashSet<&str> = diagnoses.iter().map(|d| d.unit_id.as_str()).collect();
        let mut seen = HashSet::new();

        for (unit_id, actions) in &self.actions {
            if !known.contains(unit_id.as_str()) {
                return Err(RepairError::MalformedPlan(format!(
                    "plan references unknown unit {unit_id}"
                )));
            }
            if actions.is_empty() {
                return Err(RepairError::MalformedPlan(format!(
                    "unit {unit_id} has an empty action list"
                )));
            }
            for action in actions {
                if &action.unit_id != unit_id {
                    return Err(RepairError::MalformedPlan(format!(
                        "action for unit {} listed under {unit_id}",
                        action.unit_id
                    )));
                }
                if !is_confidence(action.confidence) {
                    return Err(RepairError::MalformedPlan(format!(
                        "action {} confidence {} outside [0, 1]",
                        action.action_id.short(),
                        action.confidence
                    )));
                }
                let expected = RepairAction::identity(&action.unit_id, &action.tool)?;
                if expected != action.action_id {
                    return Err(RepairError::MalformedPlan(format!(
                        "action {} identity does not match its contents",
                        action.action_id.short()
                    )));
                }
                if !seen.insert(action.action_id.as_str()) {
                    return Err(RepairError::MalformedPlan(format!(
                        "duplicate action {}",
                        action.action_id.short()
                    )));
                }
            }
        }

        for skip in &self.skipped {
            if !known.contains(skip.unit_id.as_str()) {
                return Err(RepairError::MalformedPlan(format!(
                    "plan skips unknown unit {}",
                    skip.unit_id
                )));
            }
        }
        Ok(())
    }

    /// Give every diagnosed unit without actions an explicit skip.
    pub fn cover_unplanned(&mut self, diagnoses: &[Diagnosis]) {
        for diagnosis in diagnoses {
            let unit = diagnosis.unit_id.as_str();
            if !self.actions.contains_key(unit) && !self.is_skipped(unit) {
                self.skip(unit, NO_ACTION_PROPOSED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::action::{RepairTool, DEFAULT_APPROVER};
    use serde_json::json;

    fn diag(unit: &str) -> Diagnosis {
        Diagnosis {
            unit_id: unit.into(),
            findings: json!({}),
            confidence: 0.9,
        }
    }

    fn action(unit: &str, confidence: f64) -> RepairAction {
        RepairAction::new(
            unit,
            RepairTool::RequestApproval {
                approver: DEFAULT_APPROVER.into(),
                approval_request_contents: format!("approve {unit}"),
                order_id: unit.into(),
            },
            confidence,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_plan() {
        let mut plan = RepairPlan::new();
        plan.add_action(action("A", 0.8));
        plan.add_action(action("B", 0.99));
        assert!(plan.validate(&[diag("A"), diag("B")]).is_ok());
        assert_eq!(plan.action_count(), 2);
        assert_eq!(plan.min_confidence(), Some(0.8));
    }

    #[test]
    fn test_unknown_unit_is_malformed() {
        let mut plan = RepairPlan::new();
        plan.add_action(action("Z", 0.8));
        let err = plan.validate(&[diag("A")]).unwrap_err();
        assert!(matches!(err, RepairError::MalformedPlan(_)));
    }

    #[test]
    fn test_out_of_range_confidence_is_malformed() {
        let mut plan = RepairPlan::new();
        plan.add_action(action("A", 1.2));
        assert!(plan.validate(&[diag("A")]).is_err());
    }

    #[test]
    fn test_tampered_identity_is_malformed() {
        let mut plan = RepairPlan::new();
        let mut a = action("A", 0.9);
        a.tool = RepairTool::RequestApproval {
            approver: "someone-else".into(),
            approval_request_contents: "x".into(),
            order_id: "A".into(),
        };
        plan.add_action(a);
        assert!(plan.validate(&[diag("A")]).is_err());
    }

    #[test]
    fn test_cover_unplanned_adds_skips() {
        let mut plan = RepairPlan::new();
        plan.add_action(action("A", 0.9));
        plan.cover_unplanned(&[diag("A"), diag("B")]);
        assert_eq!(plan.skipped, vec![SkippedUnit::new("B", NO_ACTION_PROPOSED)]);
    }

    #[test]
    fn test_empty_plan_has_no_min_confidence() {
        assert_eq!(RepairPlan::new().min_confidence(), None);
    }
}
