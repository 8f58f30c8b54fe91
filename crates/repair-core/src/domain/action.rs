//! Repair actions and their per-action outcomes.

use std::fmt;

use repair_state::ContentDigest;
use serde::{Deserialize, Serialize};

use super::error::Result;

/// Default recipient of approval requests.
pub const DEFAULT_APPROVER: &str = "approve-orders@diagonalley.co.uk";

/// Closed set of repair actions with the arguments each kind needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool_name", content = "tool_arguments", rename_all = "snake_case")]
pub enum RepairTool {
    /// Ask an approver to release an order held for approval.
    RequestApproval {
        approver: String,
        approval_request_contents: String,
        order_id: String,
    },
    /// Restock an item and complete the order waiting on it.
    OrderInventory {
        inventory_to_order: String,
        inventory_description: String,
        quantity: u32,
        order_id: String,
    },
    /// Ask the customer to update a failed payment method.
    RequestPaymentUpdate {
        customer_name: String,
        customer_id: String,
        original_payment_method: String,
        additional_notes: String,
        order_id: String,
    },
}

/// Discriminant of [`RepairTool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RequestApproval,
    OrderInventory,
    RequestPaymentUpdate,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestApproval => "request_approval",
            Self::OrderInventory => "order_inventory",
            Self::RequestPaymentUpdate => "request_payment_update",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RepairTool {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::RequestApproval { .. } => ActionKind::RequestApproval,
            Self::OrderInventory { .. } => ActionKind::OrderInventory,
            Self::RequestPaymentUpdate { .. } => ActionKind::RequestPaymentUpdate,
        }
    }

    pub fn order_id(&self) -> &str {
        match self {
            Self::RequestApproval { order_id, .. }
            | Self::OrderInventory { order_id, .. }
            | Self::RequestPaymentUpdate { order_id, .. } => order_id,
        }
    }
}

/// A proposed repair for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAction {
    /// Content digest of (unit, kind, arguments). Idempotency key.
    pub action_id: ContentDigest,
    pub unit_id: String,
    pub tool: RepairTool,
    pub confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RepairAction {
    pub fn new(unit_id: impl Into<String>, tool: RepairTool, confidence: f64) -> Result<Self> {
        let unit_id = unit_id.into();
        let action_id = Self::identity(&unit_id, &tool)?;
        Ok(Self {
            action_id,
            unit_id,
            tool,
            confidence,
            notes: None,
        })
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Stable identity of an action: digest of its unit and tool call.
    pub fn identity(unit_id: &str, tool: &RepairTool) -> Result<ContentDigest> {
        let bytes = serde_json::to_vec(&(unit_id, tool))?;
        Ok(ContentDigest::from_bytes(&bytes))
    }

    pub fn kind(&self) -> ActionKind {
        self.tool.kind()
    }
}

/// Per-action outcome tracked in the cycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Pending,
    Succeeded { detail: String, attempts: u32 },
    Failed { error: String, attempts: u32 },
    Skipped { reason: String },
}

impl ActionOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}
