//! Error types for repair-state

use thiserror::Error;

/// Errors raised by the durable state store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Could not connect to or select the backing database
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),

    /// Query or driver failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Cycle record not found
    #[error("cycle not found: {run_id}")]
    CycleNotFound { run_id: String },

    /// `create_cycle` on a run id with an unfinished record
    #[error("cycle already exists and is unfinished: {run_id}")]
    CycleExists { run_id: String },

    /// Write to, or claim of, a cycle that already reached a terminal phase
    #[error("cycle {run_id} already finished in {phase}")]
    CycleFinished { run_id: String, phase: String },

    /// Another host holds a live lease on the cycle
    #[error("cycle {run_id} is hosted by {owner}")]
    LeaseHeld { run_id: String, owner: String },

    /// Conditional write against an out-of-date version
    #[error("stale write to cycle {run_id}: expected version {expected}, store has {actual}")]
    StaleWrite {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    /// Schedule record not found
    #[error("schedule not found: {schedule_id}")]
    ScheduleNotFound { schedule_id: String },

    /// `create` on a schedule id that already exists
    #[error("schedule already exists: {schedule_id}")]
    ScheduleExists { schedule_id: String },

    /// Digest string is not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Stored state does not hash to its recorded digest
    #[error("digest mismatch for {run_id}: expected {expected}, got {actual}")]
    DigestMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_mismatch_display() {
        let err = StorageError::DigestMismatch {
            run_id: "run-1".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("run-1"));
        assert!(msg.contains("abc"));
        assert!(msg.contains("def"));
    }

    #[test]
    fn test_serde_error_converts() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StorageError = bad.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
