//! Domain models for the repair agent.
//!
//! Canonical definitions for the core entities:
//! - `ProblemUnit`, `Detection`, `Diagnosis`: what detection and analysis produce
//! - `RepairAction`, `RepairPlan`: what planning proposes
//! - `CycleState`, `CyclePhase`: the durable state of one DAPRR cycle
//! - `CycleReport`: how a cycle ended
//! - `Order`, `InventoryItem`: the problem domain records

pub mod action;
pub mod cycle;
pub mod error;
pub mod order;
pub mod plan;
pub mod problem;
pub mod report;

pub use action::{ActionKind, ActionOutcome, RepairAction, RepairTool, DEFAULT_APPROVER};
pub use cycle::{
    ApprovalDecision, ApprovalSignal, ApprovalVerdict, CyclePhase, CycleState, IgnoredSignal,
    PhaseTransition, SignalDecision,
};
pub use error::{ActionError, AgentError, AgentResult, RepairError, Result};
pub use order::{DomainSnapshot, InventoryItem, Order, OrderLine};
pub use plan::{RepairPlan, NO_ACTION_PROPOSED};
pub use problem::{Detection, Diagnosis, ProblemUnit, SkippedUnit};
pub use report::{CycleReport, UnitReport, UnitStatus};
