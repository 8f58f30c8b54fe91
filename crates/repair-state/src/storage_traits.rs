//! Storage trait definitions for the repair agent
//!
//! These traits define the durable-execution substrate:
//! - `CycleStore`: persisted cycle state plus the per-run signal inbox
//! - `ScheduleStore`: scheduled-trigger definitions and their firing history
//!
//! Cycle state is stored as an opaque JSON document; the orchestrator owns its
//! shape. All traits are async and backend-agnostic. In-memory fakes are
//! provided for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of the canonical JSON encoding of `value`.
    pub fn of_json(value: &serde_json::Value) -> StorageResult<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CycleStore: durable cycle state and signal inbox
// ---------------------------------------------------------------------------

/// One persisted snapshot of a cycle's state.
///
/// The latest snapshot per `run_id` wins; there is no history table.
/// `owner` and `lease_expires_at` say which process hosts the run; `version`
/// counts accepted writes and is the compare-and-set token for
/// [`CycleStore::save_cycle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub run_id: String,
    /// Links the cycles of one proactive loop or one schedule.
    pub correlation_id: Option<String>,
    /// Phase string at the time of the snapshot.
    pub phase: String,
    pub terminal: bool,
    /// Opaque state document.
    pub state: serde_json::Value,
    /// Digest of the canonical JSON of `state`.
    pub digest: ContentDigest,
    pub updated_at: DateTime<Utc>,
    /// Host currently running the cycle, if any.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl CycleRecord {
    /// Build an unowned record at version 0, computing the digest of `state`.
    pub fn new(
        run_id: impl Into<String>,
        correlation_id: Option<String>,
        phase: impl Into<String>,
        terminal: bool,
        state: serde_json::Value,
    ) -> StorageResult<Self> {
        let digest = ContentDigest::of_json(&state)?;
        Ok(Self {
            run_id: run_id.into(),
            correlation_id,
            phase: phase.into(),
            terminal,
            state,
            digest,
            updated_at: Utc::now(),
            owner: None,
            lease_expires_at: None,
            version: 0,
        })
    }

    /// Mark the record as hosted by `owner` until `expires_at`.
    pub fn with_lease(mut self, owner: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        self.owner = Some(owner.into());
        self.lease_expires_at = Some(expires_at);
        self
    }

    /// Set the version this write expects to replace.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Whether a host other than `owner` may take the record over at `now`.
    pub fn claimable_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.owner, self.lease_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => true,
        }
    }

    /// Recompute the state digest and compare it with the stored one.
    pub fn verify(&self) -> StorageResult<()> {
        let actual = ContentDigest::of_json(&self.state)?;
        if actual != self.digest {
            return Err(StorageError::DigestMismatch {
                run_id: self.run_id.clone(),
                expected: self.digest.as_str().to_string(),
                actual: actual.as_str().to_string(),
            });
        }
        Ok(())
    }
}

/// Why a conditional cycle write was refused, given the stored record.
///
/// Shared by the backends so both report the same error for the same state.
pub fn write_conflict(stored: &CycleRecord, owner: Option<&str>, expected_version: Option<u64>) -> StorageError {
    if stored.terminal {
        return StorageError::CycleFinished {
            run_id: stored.run_id.clone(),
            phase: stored.phase.clone(),
        };
    }
    if stored.owner.as_deref() != owner {
        return StorageError::LeaseHeld {
            run_id: stored.run_id.clone(),
            owner: stored.owner.clone().unwrap_or_default(),
        };
    }
    StorageError::StaleWrite {
        run_id: stored.run_id.clone(),
        expected: expected_version.unwrap_or_default(),
        actual: stored.version,
    }
}

/// Filter for [`CycleStore::list_cycles`].
#[derive(Debug, Clone, Default)]
pub struct CycleFilter {
    pub correlation_id: Option<String>,
    /// Only return records whose `terminal` flag is false.
    pub active_only: bool,
}

impl CycleFilter {
    pub fn matches(&self, record: &CycleRecord) -> bool {
        if self.active_only && record.terminal {
            return false;
        }
        match &self.correlation_id {
            Some(cid) => record.correlation_id.as_deref() == Some(cid.as_str()),
            None => true,
        }
    }
}

/// A message addressed to a run, delivered through the durable inbox.
///
/// Used for approval decisions sent from another process and for
/// notifications forwarded into a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub signal_id: String,
    pub run_id: String,
    /// Signal kind, e.g. `"approval"` or `"message"`.
    pub kind: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl SignalRecord {
    pub fn new(
        run_id: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            signal_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            kind: kind.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Durable cycle state store.
///
/// Guarantees:
/// - A terminal record is never overwritten, except by `create_cycle`
///   starting a new run under the same id.
/// - `save_cycle` only succeeds for the lease owner holding the current
///   version, so a stale host can never roll a record back.
/// - `claim_cycle` is a compare-and-set: at most one host holds a live lease.
/// - `load_cycle` returns exactly what was last saved, digest-verified.
/// - `take_signals` returns matching signals oldest first and removes them,
///   so each signal is consumed at most once.
#[async_trait]
pub trait CycleStore: Send + Sync {
    /// Insert a new cycle at version 1.
    ///
    /// Replaces a terminal record with the same id; fails with
    /// `StorageError::CycleExists` if an unfinished one is present.
    async fn create_cycle(&self, record: CycleRecord) -> StorageResult<CycleRecord>;

    /// Replace the snapshot written at `record.version` by `record.owner`.
    ///
    /// Returns the stored record with its version bumped. Fails with
    /// `CycleFinished`, `LeaseHeld` or `StaleWrite` when the stored record is
    /// terminal, owned by someone else or newer.
    async fn save_cycle(&self, record: CycleRecord) -> StorageResult<CycleRecord>;

    /// Take ownership of an unfinished cycle whose lease is free, already
    /// held by `owner`, or expired at `now`. Bumps the version.
    async fn claim_cycle(
        &self,
        run_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StorageResult<CycleRecord>;

    /// Extend the lease of a cycle `owner` holds. Does not change the version.
    async fn renew_lease(&self, run_id: &str, owner: &str, lease_until: DateTime<Utc>) -> StorageResult<()>;

    /// Drop `owner`'s lease so another host can resume the cycle at once.
    /// A no-op when `owner` does not hold it.
    async fn release_cycle(&self, run_id: &str, owner: &str) -> StorageResult<()>;

    /// Load the latest snapshot. Returns `StorageError::CycleNotFound` if absent.
    async fn load_cycle(&self, run_id: &str) -> StorageResult<CycleRecord>;

    /// List snapshots, newest first.
    async fn list_cycles(&self, filter: &CycleFilter) -> StorageResult<Vec<CycleRecord>>;

    /// Append a signal to a run's inbox.
    async fn put_signal(&self, signal: SignalRecord) -> StorageResult<()>;

    /// Signals of `kind` addressed to `run_id`, oldest first, without removing them.
    async fn list_signals(&self, run_id: &str, kind: &str) -> StorageResult<Vec<SignalRecord>>;

    /// Remove and return all signals of `kind` addressed to `run_id`, oldest first.
    async fn take_signals(&self, run_id: &str, kind: &str) -> StorageResult<Vec<SignalRecord>>;
}

// ---------------------------------------------------------------------------
// ScheduleStore: scheduled trigger definitions
// ---------------------------------------------------------------------------

/// A persisted schedule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule_id: String,
    /// Opaque schedule spec (interval, cycle configuration, ...).
    pub spec: serde_json::Value,
    pub note: Option<String>,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
}

impl ScheduleRecord {
    pub fn new(
        schedule_id: impl Into<String>,
        spec: serde_json::Value,
        note: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schedule_id: schedule_id.into(),
            spec,
            note,
            paused: false,
            created_at: now,
            updated_at: now,
            last_fired_at: None,
            last_run_id: None,
        }
    }
}

/// Store of scheduled trigger definitions.
///
/// Semantics:
/// - `create` fails with `ScheduleExists` if the id is taken.
/// - `upsert` creates, or replaces spec/note/paused of an existing schedule
///   while keeping its creation time and firing history. Returns `true` when
///   a new schedule was created.
/// - `delete` fails with `ScheduleNotFound` if absent.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, record: ScheduleRecord) -> StorageResult<ScheduleRecord>;

    async fn upsert_schedule(&self, record: ScheduleRecord) -> StorageResult<bool>;

    async fn get_schedule(&self, schedule_id: &str) -> StorageResult<Option<ScheduleRecord>>;

    async fn delete_schedule(&self, schedule_id: &str) -> StorageResult<()>;

    async fn list_schedules(&self) -> StorageResult<Vec<ScheduleRecord>>;

    /// Stamp a firing on the schedule.
    async fn record_firing(
        &self,
        schedule_id: &str,
        run_id: &str,
        fired_at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

/// Convenience bound for backends implementing both stores.
pub trait StateStore: CycleStore + ScheduleStore {}

impl<T: CycleStore + ScheduleStore> StateStore for T {}
