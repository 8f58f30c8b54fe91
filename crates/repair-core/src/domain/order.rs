//! Order and inventory records of the problem domain.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Order statuses that need no further processing.
pub const SETTLED_STATUSES: &[&str] = &[
    "completed",
    "shipped",
    "delivered",
    "cancelled",
    "approved-preparing-shipment",
    "payment_update_requested",
];

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub quantity: u32,
}

fn normalize_status(status: &str) -> String {
    status.trim().to_ascii_lowercase().replace('_', "-")
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub order_date: NaiveDate,
    pub status: String,
    pub customer_name: String,
    pub customer_id: String,
    pub payment_method: String,
    #[serde(default)]
    pub items: Vec<OrderLine>,
}

impl Order {
    /// Status compared case-insensitively, with `_` read as `-`.
    pub fn normalized_status(&self) -> String {
        normalize_status(&self.status)
    }

    /// Whether the order is in a settled status.
    pub fn is_settled(&self) -> bool {
        let status = self.normalized_status();
        SETTLED_STATUSES.iter().any(|s| normalize_status(s) == status)
    }

    /// Days between the order date and `today`.
    pub fn age_days(&self, today: NaiveDate) -> i64 {
        (today - self.order_date).num_days()
    }
}

/// Stock record for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_id: String,
    pub description: String,
    pub current_stock: u32,
    pub available_stock: u32,
    #[serde(default)]
    pub last_ordered: Option<String>,
}

/// Point-in-time view of the domain handed to agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub orders: Vec<Order>,
    pub inventory: Vec<InventoryItem>,
}

impl DomainSnapshot {
    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.order_id == order_id)
    }

    pub fn item(&self, item_id: &str) -> Option<&InventoryItem> {
        self.inventory.iter().find(|i| i.item_id == item_id)
    }

    /// Lines of `order` whose quantity exceeds available stock, with the shortfall.
    pub fn shortfalls<'a>(&'a self, order: &'a Order) -> Vec<(&'a OrderLine, u32)> {
        order
            .items
            .iter()
            .filter_map(|line| {
                let available = self.item(&line.item_id).map_or(0, |i| i.available_stock);
                (line.quantity > available).then(|| (line, line.quantity - available))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(status: &str) -> Order {
        Order {
            order_id: "ORD-1".into(),
            order_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            status: status.into(),
            customer_name: "Hermione Granger".into(),
            customer_id: "C-7".into(),
            payment_method: "gringotts-transfer".into(),
            items: vec![OrderLine {
                item_id: "WAND-1".into(),
                description: None,
                quantity: 3,
            }],
        }
    }

    #[test]
    fn test_settled_statuses() {
        assert!(order("completed").is_settled());
        assert!(!order("pending").is_settled());
    }

    #[test]
    fn test_settled_ignores_separator_and_case() {
        assert!(order("payment_update_requested").is_settled());
        assert!(order("payment-update-requested").is_settled());
        assert!(order("Approved_Preparing_Shipment").is_settled());
        assert!(!order("payment_failed").is_settled());
    }

    #[test]
    fn test_age_days() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 28).unwrap();
        assert_eq!(order("pending").age_days(today), 27);
    }

    #[test]
    fn test_shortfall_counts_missing_items_as_zero_stock() {
        let snap = DomainSnapshot {
            orders: vec![order("backordered")],
            inventory: vec![],
        };
        let o = snap.order("ORD-1").unwrap();
        let short = snap.shortfalls(o);
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].1, 3);
    }
}
