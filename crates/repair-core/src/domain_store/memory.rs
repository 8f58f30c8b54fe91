//! In-memory domain store.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::handlers::apply_tool;
use super::{ApplyReceipt, DomainStore};
use crate::domain::{ActionError, DomainSnapshot, InventoryItem, Order, RepairAction};

#[derive(Debug, Default)]
struct Inner {
    snapshot: DomainSnapshot,
    applied: HashMap<String, String>,
    apply_calls: u64,
    unavailable_orders: HashSet<String>,
}

/// Domain store held in memory. Used by tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryDomainStore {
    inner: Mutex<Inner>,
}

impl MemoryDomainStore {
    pub fn new(snapshot: DomainSnapshot) -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ActionError> {
        self.inner
            .lock()
            .map_err(|_| ActionError::Store("domain store lock poisoned".to_string()))
    }

    /// Make every apply against `order_id` fail as unavailable.
    pub fn make_unavailable(&self, order_id: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.unavailable_orders.insert(order_id.to_string());
        }
    }

    /// Number of `apply` calls that reached the store, replays included.
    pub fn apply_calls(&self) -> u64 {
        self.lock().map(|i| i.apply_calls).unwrap_or(0)
    }

    /// Number of distinct actions applied.
    pub fn applied_count(&self) -> usize {
        self.lock().map(|i| i.applied.len()).unwrap_or(0)
    }

    pub fn current(&self) -> DomainSnapshot {
        self.lock().map(|i| i.snapshot.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DomainStore for MemoryDomainStore {
    async fn load_orders(&self) -> Result<Vec<Order>, ActionError> {
        Ok(self.lock()?.snapshot.orders.clone())
    }

    async fn load_inventory(&self) -> Result<Vec<InventoryItem>, ActionError> {
        Ok(self.lock()?.snapshot.inventory.clone())
    }

    async fn apply(&self, action: &RepairAction) -> Result<ApplyReceipt, ActionError> {
        let mut inner = self.lock()?;
        inner.apply_calls += 1;
        let action_id = action.action_id.as_str().to_string();

        if let Some(message) = inner.applied.get(&action_id) {
            debug!(action_id = %action_id, "action already applied");
            return Ok(ApplyReceipt {
                action_id,
                message: message.clone(),
                replayed: true,
            });
        }
        if inner.unavailable_orders.contains(action.tool.order_id()) {
            return Err(ActionError::Unavailable(format!(
                "order {} is locked",
                action.tool.order_id()
            )));
        }

        let Inner {
            snapshot, applied, ..
        } = &mut *inner;
        let message = apply_tool(&mut snapshot.orders, &mut snapshot.inventory, &action.tool)?;
        applied.insert(action_id.clone(), message.clone());
        Ok(ApplyReceipt {
            action_id,
            message,
            replayed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderLine, RepairTool, DEFAULT_APPROVER};
    use chrono::NaiveDate;

    fn store() -> MemoryDomainStore {
        MemoryDomainStore::new(DomainSnapshot {
            orders: vec![Order {
                order_id: "O-1".into(),
                order_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                status: "pending-approval".into(),
                customer_name: "Ginny".into(),
                customer_id: "C-2".into(),
                payment_method: "galleons".into(),
                items: vec![OrderLine {
                    item_id: "BROOM".into(),
                    description: None,
                    quantity: 1,
                }],
            }],
            inventory: vec![],
        })
    }

    fn approve() -> RepairAction {
        RepairAction::new(
            "O-1",
            RepairTool::RequestApproval {
                approver: DEFAULT_APPROVER.into(),
                approval_request_contents: "please".into(),
                order_id: "O-1".into(),
            },
            0.9,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_twice_is_replayed() {
        let s = store();
        let first = s.apply(&approve()).await.unwrap();
        let after_first = s.current();
        let second = s.apply(&approve()).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.message, second.message);
        assert_eq!(s.current(), after_first);
        assert_eq!(s.applied_count(), 1);
        assert_eq!(s.apply_calls(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_order() {
        let s = store();
        s.make_unavailable("O-1");
        let err = s.apply(&approve()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(s.applied_count(), 0);
    }
}
