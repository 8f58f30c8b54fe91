//! The problem-domain collaborator: read orders and inventory, apply repairs.
//!
//! Every store records the identity of each action it applied, so applying
//! the same [`RepairAction`] twice leaves the domain as a single application
//! would and returns the recorded result.

mod handlers;
mod json_file;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ActionError, DomainSnapshot, InventoryItem, Order, RepairAction};

pub use json_file::JsonFileDomainStore;
pub use memory::MemoryDomainStore;

/// What the store reports back for an applied action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReceipt {
    pub action_id: String,
    pub message: String,
    /// The action had already been applied; nothing changed.
    pub replayed: bool,
}

#[async_trait]
pub trait DomainStore: Send + Sync {
    async fn load_orders(&self) -> Result<Vec<Order>, ActionError>;

    async fn load_inventory(&self) -> Result<Vec<InventoryItem>, ActionError>;

    async fn snapshot(&self) -> Result<DomainSnapshot, ActionError> {
        Ok(DomainSnapshot {
            orders: self.load_orders().await?,
            inventory: self.load_inventory().await?,
        })
    }

    /// Apply one action. Idempotent by `action.action_id`.
    async fn apply(&self, action: &RepairAction) -> Result<ApplyReceipt, ActionError>;
}
