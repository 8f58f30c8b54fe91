//! Rule-based agents for the order/inventory domain.
//!
//! These let the whole cycle run deterministically without a language model.

use async_trait::async_trait;
use serde_json::json;

use crate::agents::{AnalysisAgent, DetectionAgent, PlanningAgent, ReportingAgent};
use crate::config::RuleConfig;
use crate::domain::{
    AgentError, AgentResult, CycleReport, Detection, Diagnosis, DomainSnapshot, Order,
    ProblemUnit, RepairAction, RepairPlan, RepairTool, UnitStatus,
};

/// What is wrong with an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    NeedsApproval,
    PaymentFailed,
    InsufficientStock,
    Stuck,
    None,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeedsApproval => "needs_approval",
            Self::PaymentFailed => "payment_failed",
            Self::InsufficientStock => "insufficient_stock",
            Self::Stuck => "stuck",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::NeedsApproval,
            Self::PaymentFailed,
            Self::InsufficientStock,
            Self::Stuck,
            Self::None,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }

    fn confidence(&self) -> f64 {
        match self {
            Self::NeedsApproval => 0.95,
            Self::PaymentFailed => 0.9,
            Self::InsufficientStock => 0.97,
            Self::Stuck => 0.6,
            Self::None => 0.2,
        }
    }
}

/// Classify an order against the snapshot. First match wins.
pub fn classify(order: &Order, snapshot: &DomainSnapshot, rules: &RuleConfig) -> IssueKind {
    if order.is_settled() {
        return IssueKind::None;
    }
    let status = order.normalized_status();
    if status == "pending-approval" || status == "needs-approval" {
        return IssueKind::NeedsApproval;
    }
    if status == "payment-failed" || status == "payment-declined" {
        return IssueKind::PaymentFailed;
    }
    if status == "backordered" || !snapshot.shortfalls(order).is_empty() {
        return IssueKind::InsufficientStock;
    }
    if order.age_days(rules.analysis_date) > rules.stuck_after_days {
        return IssueKind::Stuck;
    }
    IssueKind::None
}

/// Flags every unsettled order that matches a known issue.
#[derive(Debug, Clone)]
pub struct RuleDetector {
    rules: RuleConfig,
}

impl RuleDetector {
    pub fn new(rules: RuleConfig) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl DetectionAgent for RuleDetector {
    async fn detect(&self, snapshot: &DomainSnapshot) -> AgentResult<Detection> {
        let units: Vec<ProblemUnit> = snapshot
            .orders
            .iter()
            .filter_map(|order| match classify(order, snapshot, &self.rules) {
                IssueKind::None => None,
                kind => Some(ProblemUnit::for_order(&order.order_id, kind.as_str())),
            })
            .collect();
        let confidence = if units.is_empty() { 0.1 } else { 0.9 };
        Ok(Detection {
            confidence,
            notes: Some(format!(
                "{} of {} orders need attention",
                units.len(),
                snapshot.orders.len()
            )),
            units,
        })
    }
}

/// Explains one flagged order.
#[derive(Debug, Clone)]
pub struct RuleAnalyzer {
    rules: RuleConfig,
}

impl RuleAnalyzer {
    pub fn new(rules: RuleConfig) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl AnalysisAgent for RuleAnalyzer {
    async fn analyze(&self, unit: &ProblemUnit, snapshot: &DomainSnapshot) -> AgentResult<Diagnosis> {
        let order = snapshot.order(&unit.domain_ref).ok_or_else(|| {
            AgentError::Malformed(format!("no order {} in the domain store", unit.domain_ref))
        })?;
        let kind = classify(order, snapshot, &self.rules);
        let shortfalls: Vec<_> = snapshot
            .shortfalls(order)
            .into_iter()
            .map(|(line, missing)| json!({"item_id": line.item_id, "shortfall": missing}))
            .collect();
        let description = match kind {
            IssueKind::NeedsApproval => "order is waiting for an approver".to_string(),
            IssueKind::PaymentFailed => format!("payment via {} failed", order.payment_method),
            IssueKind::InsufficientStock => {
                format!("{} line(s) cannot be filled from stock", shortfalls.len())
            }
            IssueKind::Stuck => format!(
                "order has been {} for {} days",
                order.status,
                order.age_days(self.rules.analysis_date)
            ),
            IssueKind::None => "no issue found".to_string(),
        };
        Ok(Diagnosis {
            unit_id: unit.unit_id.clone(),
            findings: json!({
                "issue_kind": kind.as_str(),
                "description": description,
                "status": order.status,
                "age_days": order.age_days(self.rules.analysis_date),
                "shortfalls": shortfalls,
            }),
            confidence: kind.confidence(),
        })
    }
}

/// Maps each diagnosis to the tool that fixes its issue kind.
#[derive(Debug, Clone)]
pub struct RulePlanner {
    rules: RuleConfig,
}

impl RulePlanner {
    pub fn new(rules: RuleConfig) -> Self {
        Self { rules }
    }

    fn actions_for(
        &self,
        diagnosis: &Diagnosis,
        order: &Order,
        snapshot: &DomainSnapshot,
    ) -> AgentResult<Vec<RepairAction>> {
        let kind = diagnosis
            .issue_kind()
            .and_then(IssueKind::parse)
            .unwrap_or(IssueKind::None);
        let unit = diagnosis.unit_id.as_str();
        let build = |tool: RepairTool, confidence: f64| {
            RepairAction::new(unit, tool, confidence)
                .map_err(|e| AgentError::Malformed(e.to_string()))
        };

        let actions = match kind {
            IssueKind::NeedsApproval | IssueKind::Stuck => vec![build(
                RepairTool::RequestApproval {
                    approver: self.rules.approver.clone(),
                    approval_request_contents: format!(
                        "Please approve order {} for {}",
                        order.order_id, order.customer_name
                    ),
                    order_id: order.order_id.clone(),
                },
                diagnosis.confidence,
            )?],
            IssueKind::PaymentFailed => vec![build(
                RepairTool::RequestPaymentUpdate {
                    customer_name: order.customer_name.clone(),
                    customer_id: order.customer_id.clone(),
                    original_payment_method: order.payment_method.clone(),
                    additional_notes: format!(
                        "Payment for order {} could not be collected",
                        order.order_id
                    ),
                    order_id: order.order_id.clone(),
                },
                diagnosis.confidence,
            )?],
            IssueKind::InsufficientStock => snapshot
                .shortfalls(order)
                .into_iter()
                .map(|(line, missing)| {
                    let description = snapshot
                        .item(&line.item_id)
                        .map(|i| i.description.clone())
                        .or_else(|| line.description.clone())
                        .unwrap_or_else(|| line.item_id.clone());
                    build(
                        RepairTool::OrderInventory {
                            inventory_to_order: line.item_id.clone(),
                            inventory_description: description,
                            quantity: missing,
                            order_id: order.order_id.clone(),
                        },
                        diagnosis.confidence,
                    )
                })
                .collect::<AgentResult<Vec<_>>>()?,
            IssueKind::None => Vec::new(),
        };
        Ok(actions)
    }
}

#[async_trait]
impl PlanningAgent for RulePlanner {
    async fn plan(&self, diagnoses: &[Diagnosis], snapshot: &DomainSnapshot) -> AgentResult<RepairPlan> {
        let mut plan = RepairPlan::new();
        for diagnosis in diagnoses {
            let Some(order) = snapshot.order(&diagnosis.unit_id) else {
                plan.skip(&diagnosis.unit_id, "order no longer in the domain store");
                continue;
            };
            let actions = self.actions_for(diagnosis, order, snapshot)?;
            if actions.is_empty() {
                plan.skip(&diagnosis.unit_id, "no repair needed");
            }
            for action in actions {
                plan.add_action(action);
            }
        }
        plan.notes = Some(format!(
            "{} action(s) for {} unit(s)",
            plan.action_count(),
            plan.actions.len()
        ));
        Ok(plan)
    }
}

/// Narrative from the tallied counts and per-unit details.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryReporter;

#[async_trait]
impl ReportingAgent for SummaryReporter {
    async fn summarize(&self, report: &CycleReport) -> AgentResult<String> {
        let mut text = format!(
            "Repair cycle {} finished in {}: {}.",
            report.run_id,
            report.terminal_phase,
            report.counts_line()
        );
        for unit in report.units.iter().filter(|u| u.status == UnitStatus::Failed) {
            text.push_str(&format!(" {} failed: {}.", unit.unit_id, unit.detail));
        }
        Ok(text)
    }
}
