//! Fan-out of approved repair actions.
//!
//! Each action runs in its own task under a shared semaphore and its own
//! bounded retry budget. Outcomes stream back over a channel so the caller
//! can persist each one as soon as it resolves; a failing action never
//! affects its siblings.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{instrument, warn};

use crate::domain::{ActionError, ActionOutcome, RepairAction};
use crate::domain_store::DomainStore;
use crate::retry::RetryPolicy;

/// Outcome reason for actions not started because the run was cancelled.
pub const CANCELLED_BEFORE_START: &str = "run cancelled";

/// One resolved action.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub action_id: String,
    pub outcome: ActionOutcome,
}

/// Dispatcher settings, taken from the cycle config.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

/// Start every action and return the stream of outcomes.
///
/// The receiver yields exactly one [`Resolved`] per action unless a task
/// panics, and closes once every task has finished. Actions that have not
/// started when `cancel` turns true resolve as skipped; an action already
/// retrying makes no further attempts once it does.
#[instrument(skip_all, fields(run_id = %run_id, actions = actions.len()))]
pub fn dispatch_actions(
    run_id: &str,
    domain: Arc<dyn DomainStore>,
    actions: Vec<RepairAction>,
    config: DispatchConfig,
    cancel: watch::Receiver<bool>,
) -> mpsc::Receiver<Resolved> {
    let (tx, rx) = mpsc::channel(actions.len().max(1));
    let sem = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

    for action in actions {
        let domain = Arc::clone(&domain);
        let sem = Arc::clone(&sem);
        let tx = tx.clone();
        let retry = config.retry.clone();
        let cancel = cancel.clone();
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let action_id = action.action_id.as_str().to_string();

            let outcome = if *cancel.borrow() {
                ActionOutcome::Skipped {
                    reason: CANCELLED_BEFORE_START.to_string(),
                }
            } else {
                let label = format!("action.{}", action.kind());
                let attempted = retry
                    .run(
                        &label,
                        || domain.apply(&action),
                        |e: &ActionError| e.is_retryable() && !*cancel.borrow(),
                    )
                    .await;
                let budget_left = retry
                    .max_attempts
                    .map_or(true, |max| attempted.attempts < max);
                match attempted.result {
                    Ok(receipt) => ActionOutcome::Succeeded {
                        detail: if receipt.replayed {
                            format!("{} (already applied)", receipt.message)
                        } else {
                            receipt.message
                        },
                        attempts: attempted.attempts,
                    },
                    Err(e) => {
                        warn!(
                            run_id = %run_id,
                            action_id = %action.action_id.short(),
                            error = %e,
                            "repair action failed"
                        );
                        let error = if e.is_retryable() && budget_left && *cancel.borrow() {
                            format!("{e} (retries stopped: {CANCELLED_BEFORE_START})")
                        } else {
                            e.to_string()
                        };
                        ActionOutcome::Failed {
                            error,
                            attempts: attempted.attempts,
                        }
                    }
                }
            };

            let _ = tx.send(Resolved { action_id, outcome }).await;
        });
    }

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainSnapshot, Order, RepairTool, DEFAULT_APPROVER};
    use crate::domain_store::MemoryDomainStore;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn order(id: &str) -> Order {
        Order {
            order_id: id.into(),
            order_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            status: "pending-approval".into(),
            customer_name: "Fred".into(),
            customer_id: "C-3".into(),
            payment_method: "galleons".into(),
            items: vec![],
        }
    }

    fn action(id: &str) -> RepairAction {
        RepairAction::new(
            id,
            RepairTool::RequestApproval {
                approver: DEFAULT_APPROVER.into(),
                approval_request_contents: "x".into(),
                order_id: id.into(),
            },
            0.9,
        )
        .unwrap()
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            max_concurrent: 2,
            retry: RetryPolicy::bounded(2, Duration::from_millis(5)),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Resolved>) -> Vec<Resolved> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_siblings() {
        let store = Arc::new(MemoryDomainStore::new(DomainSnapshot {
            orders: vec![order("A"), order("B"), order("C")],
            inventory: vec![],
        }));
        store.make_unavailable("B");
        let (_tx, cancel) = watch::channel(false);

        let rx = dispatch_actions(
            "r",
            store.clone(),
            vec![action("A"), action("B"), action("C")],
            config(),
            cancel,
        );
        let results = collect(rx).await;
        assert_eq!(results.len(), 3);

        let failed: Vec<_> = results
            .iter()
            .filter(|r| matches!(r.outcome, ActionOutcome::Failed { attempts: 2, .. }))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].action_id, action("B").action_id.as_str());
        assert_eq!(store.applied_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retries_in_flight() {
        let store = Arc::new(MemoryDomainStore::new(DomainSnapshot {
            orders: vec![order("A")],
            inventory: vec![],
        }));
        store.make_unavailable("A");
        let (tx, cancel) = watch::channel(false);
        let config = DispatchConfig {
            max_concurrent: 1,
            retry: RetryPolicy::bounded(50, Duration::from_millis(20)),
        };

        let rx = dispatch_actions("r", store.clone(), vec![action("A")], config, cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(true);
        });
        let results = collect(rx).await;

        match &results[0].outcome {
            ActionOutcome::Failed { error, attempts } => {
                assert!(*attempts < 50, "kept retrying after cancel: {attempts}");
                assert!(error.contains("retries stopped"), "{error}");
                assert_eq!(store.apply_calls(), u64::from(*attempts));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips() {
        let store = Arc::new(MemoryDomainStore::new(DomainSnapshot {
            orders: vec![order("A")],
            inventory: vec![],
        }));
        let (_tx, cancel) = watch::channel(true);
        let results = collect(dispatch_actions("r", store.clone(), vec![action("A")], config(), cancel)).await;
        assert!(matches!(results[0].outcome, ActionOutcome::Skipped { .. }));
        assert_eq!(store.apply_calls(), 0);
    }
}
