//! The approval gate.
//!
//! A pure function over (plan, optional signal, threshold). The weakest
//! action gates the whole plan: auto-approval needs every action at or
//! above the threshold.

use chrono::{DateTime, Utc};

use crate::domain::{ApprovalDecision, ApprovalSignal, ApprovalVerdict, RepairPlan, SignalDecision};

/// Actor recorded on auto-approved plans.
pub const AUTO_APPROVER: &str = "repair-agent";

/// Whether `plan` needs a human decision under `threshold`.
///
/// An empty plan never does.
pub fn requires_approval(plan: &RepairPlan, threshold: f64) -> bool {
    plan.min_confidence().is_some_and(|min| min < threshold)
}

/// Resolve the gate.
///
/// Returns `None` while a human decision is needed and no signal is present.
pub fn evaluate_gate(
    plan: &RepairPlan,
    signal: Option<&ApprovalSignal>,
    threshold: f64,
    now: DateTime<Utc>,
) -> Option<ApprovalDecision> {
    if !requires_approval(plan, threshold) {
        let score = plan.min_confidence().unwrap_or(1.0);
        return Some(ApprovalDecision {
            verdict: ApprovalVerdict::AutoApproved,
            actor: Some(AUTO_APPROVER.to_string()),
            note: Some(format!("Agentically approved with confidence score {score}")),
            decided_at: now,
        });
    }

    signal.map(|s| ApprovalDecision {
        verdict: match s.decision {
            SignalDecision::Approve => ApprovalVerdict::Approved,
            SignalDecision::Reject => ApprovalVerdict::Rejected,
        },
        actor: s.actor.clone(),
        note: s.note.clone(),
        decided_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RepairAction, RepairTool, DEFAULT_APPROVER};

    fn plan(confidences: &[f64]) -> RepairPlan {
        let mut plan = RepairPlan::new();
        for (i, c) in confidences.iter().enumerate() {
            let unit = format!("U-{i}");
            plan.add_action(
                RepairAction::new(
                    &unit,
                    RepairTool::RequestApproval {
                        approver: DEFAULT_APPROVER.into(),
                        approval_request_contents: "x".into(),
                        order_id: unit.clone(),
                    },
                    *c,
                )
                .unwrap(),
            );
        }
        plan
    }

    #[test]
    fn test_all_above_threshold_auto_approves() {
        let d = evaluate_gate(&plan(&[0.95, 0.99, 0.96]), None, 0.95, Utc::now()).unwrap();
        assert_eq!(d.verdict, ApprovalVerdict::AutoApproved);
        assert_eq!(d.actor.as_deref(), Some(AUTO_APPROVER));
    }

    #[test]
    fn test_weakest_action_gates_plan() {
        let p = plan(&[0.8, 0.95, 0.9, 0.95]);
        assert!(requires_approval(&p, 0.95));
        assert!(evaluate_gate(&p, None, 0.95, Utc::now()).is_none());
    }

    #[test]
    fn test_signal_decides_when_below_threshold() {
        let p = plan(&[0.5]);
        let approve = ApprovalSignal::approve(Some("ops".into()), Some("fine".into()));
        let d = evaluate_gate(&p, Some(&approve), 0.95, Utc::now()).unwrap();
        assert_eq!(d.verdict, ApprovalVerdict::Approved);
        assert_eq!(d.note.as_deref(), Some("fine"));

        let reject = ApprovalSignal::reject(None, None);
        let d = evaluate_gate(&p, Some(&reject), 0.95, Utc::now()).unwrap();
        assert_eq!(d.verdict, ApprovalVerdict::Rejected);
    }

    #[test]
    fn test_signal_is_irrelevant_above_threshold() {
        let reject = ApprovalSignal::reject(None, None);
        let d = evaluate_gate(&plan(&[0.99]), Some(&reject), 0.95, Utc::now()).unwrap();
        assert_eq!(d.verdict, ApprovalVerdict::AutoApproved);
    }

    #[test]
    fn test_empty_plan_auto_approves() {
        assert!(!requires_approval(&RepairPlan::new(), 0.95));
    }
}
