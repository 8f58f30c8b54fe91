//! "Problems found" notifications from the proactive loop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repair_state::{CycleStore, SignalRecord, StateStore};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{ProblemUnit, RepairError, Result};

/// Inbox kind used when forwarding a notification into another run.
pub const MESSAGE_SIGNAL_KIND: &str = "message";

/// Where notifications go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationTarget {
    /// Structured log line only.
    Log,
    /// Logged as an email would be sent; there is no mail transport.
    Email { address: String, subject: String },
    /// HTTP POST of the notification as JSON.
    Webhook { url: String },
    /// Message into another run's durable inbox.
    Signal { run_id: String },
}

/// Payload sent when a loop cycle finds problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemNotification {
    pub correlation_id: String,
    pub run_id: String,
    pub iteration: u32,
    pub detection_confidence: Option<f64>,
    pub units: Vec<ProblemUnit>,
    pub detected_at: DateTime<Utc>,
}

impl ProblemNotification {
    pub fn headline(&self) -> String {
        format!(
            "{} problem(s) detected in {} (iteration {})",
            self.units.len(),
            self.run_id,
            self.iteration
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &ProblemNotification) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &ProblemNotification) -> Result<()> {
        info!(
            event = "loop.problems_found",
            correlation_id = %n.correlation_id,
            run_id = %n.run_id,
            units = n.units.len(),
            "{}",
            n.headline()
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmailNotifier {
    address: String,
    subject: String,
}

impl EmailNotifier {
    pub fn new(address: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, n: &ProblemNotification) -> Result<()> {
        let units: Vec<&str> = n.units.iter().map(|u| u.unit_id.as_str()).collect();
        info!(
            event = "loop.email",
            to = %self.address,
            subject = %self.subject,
            run_id = %n.run_id,
            units = ?units,
            "{}",
            n.headline()
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repair-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| RepairError::Notification(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &ProblemNotification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RepairError::Notification(format!("webhook {}: {e}", self.url)))?;
        info!(event = "loop.webhook", url = %self.url, run_id = %n.run_id, "notification delivered");
        Ok(())
    }
}

pub struct SignalNotifier {
    store: Arc<dyn StateStore>,
    run_id: String,
}

impl SignalNotifier {
    pub fn new(store: Arc<dyn StateStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl Notifier for SignalNotifier {
    async fn notify(&self, n: &ProblemNotification) -> Result<()> {
        let payload = serde_json::to_value(n)?;
        self.store
            .put_signal(SignalRecord::new(&self.run_id, MESSAGE_SIGNAL_KIND, payload))
            .await?;
        Ok(())
    }
}

/// Build the notifier for `target`.
pub fn notifier_for(target: &NotificationTarget, store: Arc<dyn StateStore>) -> Result<Arc<dyn Notifier>> {
    let notifier: Arc<dyn Notifier> = match target {
        NotificationTarget::Log => Arc::new(LogNotifier),
        NotificationTarget::Email { address, subject } => {
            Arc::new(EmailNotifier::new(address, subject))
        }
        NotificationTarget::Webhook { url } => Arc::new(WebhookNotifier::new(url)?),
        NotificationTarget::Signal { run_id } => Arc::new(SignalNotifier::new(store, run_id)),
    };
    Ok(notifier)
}
