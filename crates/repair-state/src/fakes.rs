//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryStateStore` satisfies both `CycleStore` and `ScheduleStore`
//! without any external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    cycles: HashMap<String, CycleRecord>,
    signals: Vec<SignalRecord>,
    schedules: HashMap<String, ScheduleRecord>,
}

/// In-memory state store backed by `HashMap`s behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    tables: Mutex<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    /// Overwrite a stored record's state without recomputing its digest.
    ///
    /// Lets tests simulate on-disk corruption.
    pub fn corrupt_cycle(&self, run_id: &str, state: serde_json::Value) -> StorageResult<()> {
        let mut tables = self.lock()?;
        let record = tables
            .cycles
            .get_mut(run_id)
            .ok_or_else(|| StorageError::CycleNotFound {
                run_id: run_id.to_string(),
            })?;
        record.state = state;
        Ok(())
    }
}

#[async_trait]
impl CycleStore for MemoryStateStore {
    async fn create_cycle(&self, mut record: CycleRecord) -> StorageResult<CycleRecord> {
        let mut tables = self.lock()?;
        if let Some(existing) = tables.cycles.get(&record.run_id) {
            if !existing.terminal {
                return Err(StorageError::CycleExists {
                    run_id: record.run_id,
                });
            }
        }
        record.version = 1;
        tables.cycles.insert(record.run_id.clone(), record.clone());
        Ok(record)
    }

    async fn save_cycle(&self, mut record: CycleRecord) -> StorageResult<CycleRecord> {
        let mut tables = self.lock()?;
        let stored = tables
            .cycles
            .get(&record.run_id)
            .ok_or_else(|| StorageError::CycleNotFound {
                run_id: record.run_id.clone(),
            })?;
        if stored.terminal || stored.owner != record.owner || stored.version != record.version {
            return Err(write_conflict(stored, record.owner.as_deref(), Some(record.version)));
        }
        record.version += 1;
        tables.cycles.insert(record.run_id.clone(), record.clone());
        Ok(record)
    }

    async fn claim_cycle(
        &self,
        run_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StorageResult<CycleRecord> {
        let mut tables = self.lock()?;
        let stored = tables
            .cycles
            .get_mut(run_id)
            .ok_or_else(|| StorageError::CycleNotFound {
                run_id: run_id.to_string(),
            })?;
        if stored.terminal || !stored.claimable_by(owner, now) {
            return Err(write_conflict(stored, Some(owner), None));
        }
        stored.owner = Some(owner.to_string());
        stored.lease_expires_at = Some(lease_until);
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn renew_lease(&self, run_id: &str, owner: &str, lease_until: DateTime<Utc>) -> StorageResult<()> {
        let mut tables = self.lock()?;
        let stored = tables
            .cycles
            .get_mut(run_id)
            .ok_or_else(|| StorageError::CycleNotFound {
                run_id: run_id.to_string(),
            })?;
        if stored.terminal || stored.owner.as_deref() != Some(owner) {
            return Err(write_conflict(stored, Some(owner), None));
        }
        stored.lease_expires_at = Some(lease_until);
        Ok(())
    }

    async fn release_cycle(&self, run_id: &str, owner: &str) -> StorageResult<()> {
        let mut tables = self.lock()?;
        if let Some(stored) = tables.cycles.get_mut(run_id) {
            if stored.owner.as_deref() == Some(owner) {
                stored.owner = None;
                stored.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn load_cycle(&self, run_id: &str) -> StorageResult<CycleRecord> {
        let tables = self.lock()?;
        let record = tables
            .cycles
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::CycleNotFound {
                run_id: run_id.to_string(),
            })?;
        record.verify()?;
        Ok(record)
    }

    async fn list_cycles(&self, filter: &CycleFilter) -> StorageResult<Vec<CycleRecord>> {
        let tables = self.lock()?;
        let mut out: Vec<CycleRecord> = tables
            .cycles
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn put_signal(&self, signal: SignalRecord) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables.signals.push(signal);
        Ok(())
    }

    async fn list_signals(&self, run_id: &str, kind: &str) -> StorageResult<Vec<SignalRecord>> {
        let tables = self.lock()?;
        Ok(tables
            .signals
            .iter()
            .filter(|s| s.run_id == run_id && s.kind == kind)
            .cloned()
            .collect())
    }

    async fn take_signals(&self, run_id: &str, kind: &str) -> StorageResult<Vec<SignalRecord>> {
        let mut tables = self.lock()?;
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.signals)
            .into_iter()
            .partition(|s| s.run_id == run_id && s.kind == kind);
        tables.signals = kept;
        Ok(taken)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStateStore {
    async fn create_schedule(&self, record: ScheduleRecord) -> StorageResult<ScheduleRecord> {
        let mut tables = self.lock()?;
        if tables.schedules.contains_key(&record.schedule_id) {
            return Err(StorageError::ScheduleExists {
                schedule_id: record.schedule_id,
            });
        }
        tables
            .schedules
            .insert(record.schedule_id.clone(), record.clone());
        Ok(record)
    }

    async fn upsert_schedule(&self, record: ScheduleRecord) -> StorageResult<bool> {
        let mut tables = self.lock()?;
        match tables.schedules.get_mut(&record.schedule_id) {
            Some(existing) => {
                existing.spec = record.spec;
                existing.note = record.note;
                existing.paused = record.paused;
                existing.updated_at = Utc::now();
                Ok(false)
            }
            None => {
                tables.schedules.insert(record.schedule_id.clone(), record);
                Ok(true)
            }
        }
    }

    async fn get_schedule(&self, schedule_id: &str) -> StorageResult<Option<ScheduleRecord>> {
        let tables = self.lock()?;
        Ok(tables.schedules.get(schedule_id).cloned())
    }

    async fn delete_schedule(&self, schedule_id: &str) -> StorageResult<()> {
        let mut tables = self.lock()?;
        tables
            .schedules
            .remove(schedule_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::ScheduleNotFound {
                schedule_id: schedule_id.to_string(),
            })
    }

    async fn list_schedules(&self) -> StorageResult<Vec<ScheduleRecord>> {
        let tables = self.lock()?;
        let mut out: Vec<ScheduleRecord> = tables.schedules.values().cloned().collect();
        out.sort_by(|a, b| a.schedule_id.cmp(&b.schedule_id));
        Ok(out)
    }

    async fn record_firing(
        &self,
        schedule_id: &str,
        run_id: &str,
        fired_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut tables = self.lock()?;
        let record = tables.schedules.get_mut(schedule_id).ok_or_else(|| {
            StorageError::ScheduleNotFound {
                schedule_id: schedule_id.to_string(),
            }
        })?;
        record.last_fired_at = Some(fired_at);
        record.last_run_id = Some(run_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_corrupted_cycle_fails_to_load() {
        let store = MemoryStateStore::new();
        let record = CycleRecord::new("r1", None, "PENDING-REPAIR", false, json!({"n": 1})).unwrap();
        store.create_cycle(record).await.unwrap();

        store.corrupt_cycle("r1", json!({"n": 2})).unwrap();
        let err = store.load_cycle("r1").await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_release_only_drops_own_lease() {
        let store = MemoryStateStore::new();
        let record = CycleRecord::new("r1", None, "PENDING-REPAIR", false, json!({})).unwrap();
        store.create_cycle(record).await.unwrap();
        let now = Utc::now();
        let until = now + chrono::Duration::seconds(60);
        store.claim_cycle("r1", "host-a", now, until).await.unwrap();

        store.release_cycle("r1", "host-b").await.unwrap();
        assert_eq!(store.load_cycle("r1").await.unwrap().owner.as_deref(), Some("host-a"));

        store.release_cycle("r1", "host-a").await.unwrap();
        assert!(store.load_cycle("r1").await.unwrap().owner.is_none());
        store.claim_cycle("r1", "host-b", now, until).await.unwrap();
    }

    #[tokio::test]
    async fn test_take_signals_leaves_other_runs() {
        let store = MemoryStateStore::new();
        store
            .put_signal(SignalRecord::new("a", "approval", json!({})))
            .await
            .unwrap();
        store
            .put_signal(SignalRecord::new("b", "approval", json!({})))
            .await
            .unwrap();

        assert_eq!(store.take_signals("a", "approval").await.unwrap().len(), 1);
        assert!(store.take_signals("a", "approval").await.unwrap().is_empty());
        assert_eq!(store.take_signals("b", "approval").await.unwrap().len(), 1);
    }
}
