//! Error taxonomy for the repair agent.

use repair_state::StorageError;

/// Failures reported by detection, analysis, planning and reporting agents.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    /// Temporary failure (timeouts, rate limits). Retried with backoff.
    #[error("transient agent failure: {0}")]
    Transient(String),

    /// The agent produced output that does not satisfy its contract.
    #[error("malformed agent output: {0}")]
    Malformed(String),

    /// The agent cannot serve this request at all.
    #[error("agent unavailable: {0}")]
    Unavailable(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type for agent calls.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Failures raised by the domain store when reading records or applying an action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("unknown order: {order_id}")]
    UnknownOrder { order_id: String },

    #[error("unknown inventory item: {item_id}")]
    UnknownItem { item_id: String },

    #[error("invalid action arguments: {0}")]
    InvalidArguments(String),

    /// Temporary store failure. Retried within the action retry budget.
    #[error("domain store unavailable: {0}")]
    Unavailable(String),

    #[error("domain store error: {0}")]
    Store(String),
}

impl ActionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<std::io::Error> for ActionError {
    fn from(err: std::io::Error) -> Self {
        ActionError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(err: serde_json::Error) -> Self {
        ActionError::Store(err.to_string())
    }
}

/// Repair agent domain errors.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("run already active: {run_id}")]
    DuplicateRun { run_id: String },

    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("run {run_id} already finished in {phase}")]
    RunFinished { run_id: String, phase: String },

    #[error("schedule not found: {schedule_id}")]
    ScheduleNotFound { schedule_id: String },

    #[error("schedule already exists: {schedule_id}")]
    ScheduleExists { schedule_id: String },

    #[error("proactive loop not found: {correlation_id}")]
    LoopNotFound { correlation_id: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("illegal phase transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("cycle task aborted: {0}")]
    TaskAborted(String),

    /// This process no longer owns the run; another host took it over or it
    /// finished elsewhere.
    #[error("lost ownership of run {run_id}: {reason}")]
    LeaseLost { run_id: String, reason: String },

    #[error("{stage} agent failed: {source}")]
    Agent {
        stage: &'static str,
        #[source]
        source: AgentError,
    },

    #[error("domain store error: {0}")]
    Domain(#[from] ActionError),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for RepairError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CycleNotFound { run_id } => RepairError::RunNotFound { run_id },
            StorageError::ScheduleNotFound { schedule_id } => {
                RepairError::ScheduleNotFound { schedule_id }
            }
            StorageError::ScheduleExists { schedule_id } => {
                RepairError::ScheduleExists { schedule_id }
            }
            StorageError::DigestMismatch {
                expected, actual, ..
            } => RepairError::DigestMismatch { expected, actual },
            StorageError::CycleExists { run_id } | StorageError::LeaseHeld { run_id, .. } => {
                RepairError::DuplicateRun { run_id }
            }
            StorageError::CycleFinished { run_id, phase } => RepairError::RunFinished { run_id, phase },
            other => RepairError::Storage(other.to_string()),
        }
    }
}

/// Result type for repair agent operations.
pub type Result<T> = std::result::Result<T, RepairError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_agent_errors_retry() {
        assert!(AgentError::Transient("429".into()).is_retryable());
        assert!(!AgentError::Malformed("no json".into()).is_retryable());
        assert!(!AgentError::Unavailable("no key".into()).is_retryable());
    }

    #[test]
    fn test_storage_not_found_maps_to_run_not_found() {
        let err: RepairError = StorageError::CycleNotFound {
            run_id: "r-1".to_string(),
        }
        .into();
        assert!(matches!(err, RepairError::RunNotFound { ref run_id } if run_id == "r-1"));
    }

    #[test]
    fn test_lease_conflicts_map_to_run_errors() {
        let err: RepairError = StorageError::LeaseHeld {
            run_id: "r".into(),
            owner: "host-b".into(),
        }
        .into();
        assert!(matches!(err, RepairError::DuplicateRun { .. }));

        let err: RepairError = StorageError::CycleFinished {
            run_id: "r".into(),
            phase: "CANCELLED".into(),
        }
        .into();
        assert!(matches!(err, RepairError::RunFinished { ref phase, .. } if phase == "CANCELLED"));
    }

    #[test]
    fn test_storage_digest_mismatch_maps_through() {
        let err: RepairError = StorageError::DigestMismatch {
            run_id: "r".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .into();
        assert!(err.to_string().contains("expected aa"));
    }

    #[test]
    fn test_agent_error_display_names_stage() {
        let err = RepairError::Agent {
            stage: "detection",
            source: AgentError::Unavailable("no model".into()),
        };
        assert!(err.to_string().starts_with("detection agent failed"));
    }
}
