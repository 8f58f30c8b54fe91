//! Per-run configuration.
//!
//! Values are passed explicitly into each run and persisted with the cycle,
//! so a resumed cycle keeps the thresholds it started with.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{RepairError, Result};
use crate::notify::NotificationTarget;
use crate::retry::RetryPolicy;

/// Confidence at or above which a whole plan is approved without a human.
pub const DEFAULT_THRESHOLD: f64 = 0.95;

/// How long a plan waits for a human decision.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Inter-cycle wait of the proactive loop.
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Number of past cycles a proactive loop remembers.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Configuration of one repair cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Auto-approval threshold; the weakest action confidence is compared against it.
    pub threshold: f64,
    pub approval_timeout: Duration,
    /// Total attempts the analysis agent gets per unit for malformed output.
    pub analysis_max_attempts: u32,
    /// Detection below this confidence counts as "no problems".
    pub min_detection_confidence: f64,
    /// Actions below this confidence are never executed.
    pub min_action_confidence: f64,
    pub max_concurrent_actions: usize,
    /// Must be bounded.
    pub action_retry: RetryPolicy,
    pub agent_retry: RetryPolicy,
    /// How often a waiting cycle checks the durable inbox for approvals sent
    /// from other processes. `None` disables polling.
    pub signal_poll_interval: Option<Duration>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            analysis_max_attempts: 3,
            min_detection_confidence: 0.5,
            min_action_confidence: 0.5,
            max_concurrent_actions: 4,
            action_retry: RetryPolicy::bounded(3, Duration::from_millis(500)),
            agent_retry: RetryPolicy::unlimited(Duration::from_secs(1)),
            signal_poll_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl CycleConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_unit("threshold", self.threshold)?;
        check_unit("min_detection_confidence", self.min_detection_confidence)?;
        check_unit("min_action_confidence", self.min_action_confidence)?;
        if self.approval_timeout.is_zero() {
            return Err(invalid("approval_timeout must be positive"));
        }
        if self.analysis_max_attempts == 0 {
            return Err(invalid("analysis_max_attempts must be at least 1"));
        }
        if self.max_concurrent_actions == 0 {
            return Err(invalid("max_concurrent_actions must be at least 1"));
        }
        if !self.action_retry.is_bounded() {
            return Err(invalid("action_retry must have an attempt limit"));
        }
        self.action_retry
            .validate()
            .map_err(|e| invalid(&format!("action_retry: {e}")))?;
        self.agent_retry
            .validate()
            .map_err(|e| invalid(&format!("agent_retry: {e}")))?;
        if self.signal_poll_interval.is_some_and(|d| d.is_zero()) {
            return Err(invalid("signal_poll_interval must be positive"));
        }
        Ok(())
    }
}

/// Configuration of a proactive loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub interval: Duration,
    pub history_limit: usize,
    /// Where to send "problems found" notifications.
    #[serde(default)]
    pub notification: Option<NotificationTarget>,
    /// Stop after this many cycles. `None` runs until exit is requested.
    #[serde(default)]
    pub max_cycles: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_LOOP_INTERVAL,
            history_limit: DEFAULT_HISTORY_LIMIT,
            notification: None,
            max_cycles: None,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(invalid("loop interval must be positive"));
        }
        if self.history_limit == 0 {
            return Err(invalid("history_limit must be at least 1"));
        }
        if self.max_cycles == Some(0) {
            return Err(invalid("max_cycles must be at least 1"));
        }
        Ok(())
    }
}

/// Settings of the built-in rule-based agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// "Today" for age computations.
    pub analysis_date: NaiveDate,
    /// Orders open longer than this are considered stuck.
    pub stuck_after_days: i64,
    pub approver: String,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            analysis_date: chrono::Utc::now().date_naive(),
            stuck_after_days: 14,
            approver: crate::domain::DEFAULT_APPROVER.to_string(),
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(&format!("{name} must be within [0, 1], got {value}")))
    }
}

fn invalid(msg: &str) -> RepairError {
    RepairError::InvalidConfig(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let c = CycleConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.threshold, 0.95);
        assert_eq!(c.approval_timeout, Duration::from_secs(43_200));
        assert!(LoopConfig::default().validate().is_ok());
        assert_eq!(LoopConfig::default().history_limit, 10);
    }

    #[test]
    fn test_threshold_out_of_range() {
        let c = CycleConfig::default().with_threshold(1.5);
        assert!(matches!(c.validate(), Err(RepairError::InvalidConfig(_))));
    }

    #[test]
    fn test_unbounded_action_retry_rejected() {
        let c = CycleConfig {
            action_retry: RetryPolicy::unlimited(Duration::from_millis(10)),
            ..CycleConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let l = LoopConfig {
            interval: Duration::ZERO,
            ..LoopConfig::default()
        };
        assert!(l.validate().is_err());
    }
}
