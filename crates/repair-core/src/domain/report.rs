//! Cycle reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::action::ActionOutcome;
use super::cycle::{CyclePhase, CycleState};

static PENDING: ActionOutcome = ActionOutcome::Pending;

/// Final status of one unit within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Repaired,
    Skipped,
    Failed,
}

/// Per-unit line of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit_id: String,
    pub status: UnitStatus,
    pub detail: String,
}

/// Human-readable summary plus machine-readable counts for a finished cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: String,
    pub terminal_phase: CyclePhase,
    pub repaired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub summary: String,
    pub units: Vec<UnitReport>,
    pub generated_at: DateTime<Utc>,
}

impl CycleReport {
    /// Tally unit outcomes from `state`, as if the cycle ended in `terminal_phase`.
    ///
    /// A unit counts as failed if any of its actions failed, repaired if at
    /// least one action succeeded and none failed, and skipped otherwise.
    /// The summary is left empty for the caller to fill.
    pub fn tally(state: &CycleState, terminal_phase: CyclePhase) -> Self {
        let mut units = Vec::new();
        let mut seen = std::collections::HashSet::new();

        if let Some(plan) = &state.plan {
            for (unit_id, actions) in &plan.actions {
                seen.insert(unit_id.clone());
                let outcomes: Vec<&ActionOutcome> = actions
                    .iter()
                    .map(|a| {
                        state
                            .outcomes
                            .get(a.action_id.as_str())
                            .unwrap_or(&PENDING)
                    })
                    .collect();
                units.push(unit_line(unit_id, &outcomes));
            }
            for skip in &plan.skipped {
                if seen.insert(skip.unit_id.clone()) {
                    units.push(UnitReport {
                        unit_id: skip.unit_id.clone(),
                        status: UnitStatus::Skipped,
                        detail: skip.reason.clone(),
                    });
                }
            }
        }

        for skip in &state.analysis_skips {
            if seen.insert(skip.unit_id.clone()) {
                units.push(UnitReport {
                    unit_id: skip.unit_id.clone(),
                    status: UnitStatus::Skipped,
                    detail: skip.reason.clone(),
                });
            }
        }

        // Detected units that never reached a plan (cancelled before planning).
        let fallback = state
            .cancel_reason
            .clone()
            .unwrap_or_else(|| "not planned".to_string());
        for unit in &state.units {
            if seen.insert(unit.unit_id.clone()) {
                units.push(UnitReport {
                    unit_id: unit.unit_id.clone(),
                    status: UnitStatus::Skipped,
                    detail: fallback.clone(),
                });
            }
        }

        let count = |s: UnitStatus| units.iter().filter(|u| u.status == s).count();
        Self {
            run_id: state.run_id.clone(),
            terminal_phase,
            repaired: count(UnitStatus::Repaired),
            skipped: count(UnitStatus::Skipped),
            failed: count(UnitStatus::Failed),
            summary: String::new(),
            units,
            generated_at: Utc::now(),
        }
    }

    /// One-line count summary used when no narrative is available.
    pub fn counts_line(&self) -> String {
        format!(
            "{} repaired, {} skipped, {} failed",
            self.repaired, self.skipped, self.failed
        )
    }
}

fn unit_line(unit_id: &str, outcomes: &[&ActionOutcome]) -> UnitReport {
    let failed: Vec<&str> = outcomes
        .iter()
        .filter_map(|o| match o {
            ActionOutcome::Failed { error, .. } => Some(error.as_str()),
            _ => None,
        })
        .collect();
    if !failed.is_empty() {
        return UnitReport {
            unit_id: unit_id.to_string(),
            status: UnitStatus::Failed,
            detail: failed.join("; "),
        };
    }

    let succeeded: Vec<&str> = outcomes
        .iter()
        .filter_map(|o| match o {
            ActionOutcome::Succeeded { detail, .. } => Some(detail.as_str()),
            _ => None,
        })
        .collect();
    if !succeeded.is_empty() {
        return UnitReport {
            unit_id: unit_id.to_string(),
            status: UnitStatus::Repaired,
            detail: succeeded.join("; "),
        };
    }

    let reasons: Vec<&str> = outcomes
        .iter()
        .filter_map(|o| match o {
            ActionOutcome::Skipped { reason } => Some(reason.as_str()),
            _ => None,
        })
        .collect();
    UnitReport {
        unit_id: unit_id.to_string(),
        status: UnitStatus::Skipped,
        detail: if reasons.is_empty() {
            "not executed".to_string()
        } else {
            reasons.join("; ")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleConfig;
    use crate::domain::action::{RepairAction, RepairTool, DEFAULT_APPROVER};
    use crate::domain::plan::RepairPlan;

    fn action(unit: &str) -> RepairAction {
        RepairAction::new(
            unit,
            RepairTool::RequestApproval {
                approver: DEFAULT_APPROVER.into(),
                approval_request_contents: "ok".into(),
                order_id: unit.into(),
            },
            0.9,
        )
        .unwrap()
    }

    #[test]
    fn test_tally_counts_units() {
        let mut state = CycleState::new("r", None, CycleConfig::default());
        let mut plan = RepairPlan::new();
        let (a, b, c) = (action("A"), action("B"), action("C"));
        plan.add_action(a.clone());
        plan.add_action(b.clone());
        plan.add_action(c.clone());
        plan.skip("D", "no action proposed");
        state.plan = Some(plan);
        state.outcomes.insert(
            a.action_id.as_str().into(),
            ActionOutcome::Succeeded {
                detail: "done".into(),
                attempts: 1,
            },
        );
        state.outcomes.insert(
            b.action_id.as_str().into(),
            ActionOutcome::Failed {
                error: "boom".into(),
                attempts: 3,
            },
        );
        state.outcomes.insert(
            c.action_id.as_str().into(),
            ActionOutcome::Skipped {
                reason: "low confidence".into(),
            },
        );

        let report = CycleReport::tally(&state, CyclePhase::ReportCompleted);
        assert_eq!((report.repaired, report.failed, report.skipped), (1, 1, 2));
        assert_eq!(report.counts_line(), "1 repaired, 2 skipped, 1 failed");
    }

    #[test]
    fn test_unplanned_units_are_skipped_with_cancel_reason() {
        let mut state = CycleState::new("r", None, CycleConfig::default());
        state.units = vec![crate::domain::problem::ProblemUnit::for_order("X", "")];
        state.cancel_reason = Some("run cancelled".into());
        let report = CycleReport::tally(&state, CyclePhase::Cancelled);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.units[0].detail, "run cancelled");
    }
}
