//! One handler per action kind, shared by every store.

use chrono::Utc;

use crate::domain::{ActionError, InventoryItem, Order, RepairTool};

/// Apply `tool` to the records in place and return a human-readable result.
///
/// All lookups happen before any mutation, so a failed call leaves the
/// records untouched.
pub(crate) fn apply_tool(
    orders: &mut [Order],
    inventory: &mut [InventoryItem],
    tool: &RepairTool,
) -> Result<String, ActionError> {
    let order_idx = orders
        .iter()
        .position(|o| o.order_id == tool.order_id())
        .ok_or_else(|| ActionError::UnknownOrder {
            order_id: tool.order_id().to_string(),
        })?;

    match tool {
        RepairTool::RequestApproval {
            approver, order_id, ..
        } => {
            orders[order_idx].status = "approved-preparing-shipment".to_string();
            Ok(format!("Approval request sent to {approver} for order {order_id}."))
        }
        RepairTool::OrderInventory {
            inventory_to_order,
            quantity,
            order_id,
            ..
        } => {
            if *quantity == 0 {
                return Err(ActionError::InvalidArguments(
                    "restock quantity must be positive".to_string(),
                ));
            }
            let item = inventory
                .iter_mut()
                .find(|i| &i.item_id == inventory_to_order)
                .ok_or_else(|| ActionError::UnknownItem {
                    item_id: inventory_to_order.clone(),
                })?;
            item.current_stock = item.current_stock.saturating_add(*quantity);
            item.available_stock = item.available_stock.saturating_add(*quantity);
            item.last_ordered = Some(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string());
            orders[order_idx].status = "completed".to_string();
            Ok(format!(
                "Ordered {quantity} x {inventory_to_order} and completed order {order_id}."
            ))
        }
        RepairTool::RequestPaymentUpdate {
            customer_name,
            order_id,
            ..
        } => {
            orders[order_idx].status = "payment_update_requested".to_string();
            Ok(format!(
                "Payment update requested from {customer_name} for order {order_id}."
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderLine;
    use chrono::NaiveDate;

    fn records() -> (Vec<Order>, Vec<InventoryItem>) {
        let order = Order {
            order_id: "O-1".into(),
            order_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            status: "backordered".into(),
            customer_name: "Neville".into(),
            customer_id: "C-1".into(),
            payment_method: "sickles".into(),
            items: vec![OrderLine {
                item_id: "TOAD".into(),
                description: None,
                quantity: 2,
            }],
        };
        let item = InventoryItem {
            item_id: "TOAD".into(),
            description: "Toad".into(),
            current_stock: 1,
            available_stock: 0,
            last_ordered: None,
        };
        (vec![order], vec![item])
    }

    #[test]
    fn test_restock_updates_stock_and_order() {
        let (mut orders, mut inventory) = records();
        let tool = RepairTool::OrderInventory {
            inventory_to_order: "TOAD".into(),
            inventory_description: "Toad".into(),
            quantity: 2,
            order_id: "O-1".into(),
        };
        apply_tool(&mut orders, &mut inventory, &tool).unwrap();
        assert_eq!(inventory[0].current_stock, 3);
        assert_eq!(inventory[0].available_stock, 2);
        assert!(inventory[0].last_ordered.is_some());
        assert_eq!(orders[0].status, "completed");
    }

    #[test]
    fn test_unknown_item_leaves_records_untouched() {
        let (mut orders, mut inventory) = records();
        let tool = RepairTool::OrderInventory {
            inventory_to_order: "OWL".into(),
            inventory_description: "Owl".into(),
            quantity: 1,
            order_id: "O-1".into(),
        };
        let err = apply_tool(&mut orders, &mut inventory, &tool).unwrap_err();
        assert!(matches!(err, ActionError::UnknownItem { .. }));
        assert_eq!(orders[0].status, "backordered");
    }

    #[test]
    fn test_unknown_order() {
        let (mut orders, mut inventory) = records();
        let tool = RepairTool::RequestApproval {
            approver: "a@b".into(),
            approval_request_contents: "x".into(),
            order_id: "O-404".into(),
        };
        assert!(matches!(
            apply_tool(&mut orders, &mut inventory, &tool),
            Err(ActionError::UnknownOrder { .. })
        ));
    }
}
