//! SurrealDB-backed `CycleStore` and `ScheduleStore`
//!
//! Rows are flat documents; cycle state is kept as a JSON string so the
//! digest computed at save time matches byte for byte on load. Timestamps are
//! stored as RFC 3339 strings and converted at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::storage_traits::*;

/// Environment variable naming the database URL.
pub const DB_URL_ENV: &str = "REPAIR_DB_URL";

/// Local path used when no URL is configured.
pub const DEFAULT_DB_PATH: &str = ".repair-agent/db";

const NAMESPACE: &str = "repair";
const DATABASE: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbCycle {
    run_id: String,
    correlation_id: Option<String>,
    phase: String,
    terminal: bool,
    state_json: String,
    digest: String,
    updated_at: String,
    owner: Option<String>,
    lease_expires_at: Option<String>,
    #[serde(default)]
    version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbSignal {
    signal_id: String,
    run_id: String,
    kind: String,
    payload_json: String,
    received_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbSchedule {
    schedule_id: String,
    spec_json: String,
    note: Option<String>,
    paused: bool,
    created_at: String,
    updated_at: String,
    last_fired_at: Option<String>,
    last_run_id: Option<String>,
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

impl DbCycle {
    fn from_record(record: &CycleRecord) -> StorageResult<Self> {
        Ok(Self {
            run_id: record.run_id.clone(),
            correlation_id: record.correlation_id.clone(),
            phase: record.phase.clone(),
            terminal: record.terminal,
            state_json: serde_json::to_string(&record.state)?,
            digest: record.digest.as_str().to_string(),
            updated_at: ts(&record.updated_at),
            owner: record.owner.clone(),
            lease_expires_at: record.lease_expires_at.as_ref().map(ts),
            version: record.version,
        })
    }

    fn into_record(self) -> StorageResult<CycleRecord> {
        Ok(CycleRecord {
            state: serde_json::from_str(&self.state_json)?,
            digest: ContentDigest::try_from(self.digest)?,
            updated_at: parse_ts(&self.updated_at)?,
            lease_expires_at: self.lease_expires_at.as_deref().map(parse_ts).transpose()?,
            owner: self.owner,
            version: self.version,
            run_id: self.run_id,
            correlation_id: self.correlation_id,
            phase: self.phase,
            terminal: self.terminal,
        })
    }
}

impl DbSignal {
    fn from_record(signal: &SignalRecord) -> StorageResult<Self> {
        Ok(Self {
            signal_id: signal.signal_id.clone(),
            run_id: signal.run_id.clone(),
            kind: signal.kind.clone(),
            payload_json: serde_json::to_string(&signal.payload)?,
            received_at: ts(&signal.received_at),
        })
    }

    fn into_record(self) -> StorageResult<SignalRecord> {
        Ok(SignalRecord {
            payload: serde_json::from_str(&self.payload_json)?,
            received_at: parse_ts(&self.received_at)?,
            signal_id: self.signal_id,
            run_id: self.run_id,
            kind: self.kind,
        })
    }
}

impl DbSchedule {
    fn from_record(record: &ScheduleRecord) -> StorageResult<Self> {
        Ok(Self {
            schedule_id: record.schedule_id.clone(),
            spec_json: serde_json::to_string(&record.spec)?,
            note: record.note.clone(),
            paused: record.paused,
            created_at: ts(&record.created_at),
            updated_at: ts(&record.updated_at),
            last_fired_at: record.last_fired_at.as_ref().map(ts),
            last_run_id: record.last_run_id.clone(),
        })
    }

    fn into_record(self) -> StorageResult<ScheduleRecord> {
        Ok(ScheduleRecord {
            spec: serde_json::from_str(&self.spec_json)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_fired_at: self.last_fired_at.as_deref().map(parse_ts).transpose()?,
            schedule_id: self.schedule_id,
            note: self.note,
            paused: self.paused,
            last_run_id: self.last_run_id,
        })
    }
}

const CYCLE_FIELDS: &str = "run_id, correlation_id, phase, terminal, state_json, digest, \
                            updated_at, owner, lease_expires_at, version";
const SIGNAL_FIELDS: &str = "signal_id, run_id, kind, payload_json, received_at";
const SCHEDULE_FIELDS: &str = "schedule_id, spec_json, note, paused, created_at, updated_at, \
                               last_fired_at, last_run_id";

/// SurrealDB-backed implementation of [`CycleStore`] and [`ScheduleStore`].
#[derive(Clone)]
pub struct SurrealStateStore {
    db: Surreal<Any>,
}

impl SurrealStateStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB URL (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        if let Some(path) = url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path).map_err(|e| {
                StorageError::Connection(format!(
                    "failed to create database directory {path}: {e}"
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!(url = %url, "SurrealStateStore connected");
        Ok(Self { db })
    }

    /// Connect using `REPAIR_DB_URL`, falling back to local `surrealkv://` storage.
    pub async fn from_env() -> StorageResult<Self> {
        let url = std::env::var(DB_URL_ENV)
            .unwrap_or_else(|_| format!("surrealkv://{DEFAULT_DB_PATH}"));
        Self::connect(&url).await
    }

    async fn fetch_schedule(&self, schedule_id: &str) -> StorageResult<Option<DbSchedule>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT {SCHEDULE_FIELDS} FROM schedules WHERE schedule_id = $sid"
            ))
            .bind(("sid", schedule_id.to_string()))
            .await?;
        let rows: Vec<DbSchedule> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_cycle(&self, run_id: &str) -> StorageResult<Option<CycleRecord>> {
        let mut res = self
            .db
            .query(format!("SELECT {CYCLE_FIELDS} FROM cycles WHERE run_id = $rid"))
            .bind(("rid", run_id.to_string()))
            .await?;
        let rows: Vec<DbCycle> = res.take(0)?;
        rows.into_iter().next().map(DbCycle::into_record).transpose()
    }

    /// Explain why a conditional update matched nothing.
    async fn conflict(&self, run_id: &str, owner: Option<&str>, expected: Option<u64>) -> StorageError {
        match self.fetch_cycle(run_id).await {
            Ok(Some(stored)) => write_conflict(&stored, owner, expected),
            Ok(None) => StorageError::CycleNotFound {
                run_id: run_id.to_string(),
            },
            Err(e) => e,
        }
    }

    async fn fetch_signals(&self, run_id: &str, kind: &str) -> StorageResult<Vec<DbSignal>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT {SIGNAL_FIELDS} FROM signals WHERE run_id = $rid AND kind = $kind"
            ))
            .bind(("rid", run_id.to_string()))
            .bind(("kind", kind.to_string()))
            .await?;
        Ok(res.take(0)?)
    }

    async fn write_schedule(&self, row: DbSchedule) -> StorageResult<()> {
        let sid = row.schedule_id.clone();
        self.db
            .query("UPSERT type::thing('schedules', $sid) CONTENT $row")
            .bind(("sid", sid))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl CycleStore for SurrealStateStore {
    async fn create_cycle(&self, mut record: CycleRecord) -> StorageResult<CycleRecord> {
        record.version = 1;
        let row = DbCycle::from_record(&record)?;
        debug!(run_id = %record.run_id, "creating cycle");

        let mut res = self
            .db
            .query(
                "UPDATE type::thing('cycles', $rid) CONTENT $row \
                 WHERE terminal = true RETURN VALUE run_id",
            )
            .bind(("rid", record.run_id.clone()))
            .bind(("row", row.clone()))
            .await?;
        let replaced: Vec<String> = res.take(0)?;
        if !replaced.is_empty() {
            return Ok(record);
        }

        let created = self
            .db
            .query("CREATE type::thing('cycles', $rid) CONTENT $row")
            .bind(("rid", record.run_id.clone()))
            .bind(("row", row))
            .await?
            .check();
        if let Err(e) = created {
            return match self.fetch_cycle(&record.run_id).await? {
                Some(_) => Err(StorageError::CycleExists {
                    run_id: record.run_id,
                }),
                None => Err(e.into()),
            };
        }
        Ok(record)
    }

    async fn save_cycle(&self, mut record: CycleRecord) -> StorageResult<CycleRecord> {
        let expected = record.version;
        record.version = expected + 1;
        let row = DbCycle::from_record(&record)?;
        debug!(run_id = %record.run_id, phase = %record.phase, version = record.version, "saving cycle");

        let mut res = self
            .db
            .query(
                "UPDATE type::thing('cycles', $rid) CONTENT $row \
                 WHERE terminal = false AND version = $expected AND owner = $owner \
                 RETURN VALUE run_id",
            )
            .bind(("rid", record.run_id.clone()))
            .bind(("row", row))
            .bind(("expected", expected))
            .bind(("owner", record.owner.clone()))
            .await?;
        let updated: Vec<String> = res.take(0)?;
        if updated.is_empty() {
            return Err(self
                .conflict(&record.run_id, record.owner.as_deref(), Some(expected))
                .await);
        }
        Ok(record)
    }

    async fn claim_cycle(
        &self,
        run_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StorageResult<CycleRecord> {
        let mut res = self
            .db
            .query(
                "UPDATE type::thing('cycles', $rid) \
                 SET owner = $owner, lease_expires_at = $until, version += 1 \
                 WHERE terminal = false AND (owner = NONE OR owner = $owner \
                 OR lease_expires_at = NONE OR lease_expires_at <= $now) \
                 RETURN VALUE run_id",
            )
            .bind(("rid", run_id.to_string()))
            .bind(("owner", owner.to_string()))
            .bind(("until", ts(&lease_until)))
            .bind(("now", ts(&now)))
            .await?;
        let claimed: Vec<String> = res.take(0)?;
        if claimed.is_empty() {
            return Err(self.conflict(run_id, Some(owner), None).await);
        }
        debug!(run_id = %run_id, owner = %owner, "cycle claimed");
        self.load_cycle(run_id).await
    }

    async fn renew_lease(&self, run_id: &str, owner: &str, lease_until: DateTime<Utc>) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "UPDATE type::thing('cycles', $rid) SET lease_expires_at = $until \
                 WHERE terminal = false AND owner = $owner RETURN VALUE run_id",
            )
            .bind(("rid", run_id.to_string()))
            .bind(("owner", owner.to_string()))
            .bind(("until", ts(&lease_until)))
            .await?;
        let renewed: Vec<String> = res.take(0)?;
        if renewed.is_empty() {
            return Err(self.conflict(run_id, Some(owner), None).await);
        }
        Ok(())
    }

    async fn release_cycle(&self, run_id: &str, owner: &str) -> StorageResult<()> {
        self.db
            .query(
                "UPDATE type::thing('cycles', $rid) SET owner = NONE, lease_expires_at = NONE \
                 WHERE owner = $owner",
            )
            .bind(("rid", run_id.to_string()))
            .bind(("owner", owner.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn load_cycle(&self, run_id: &str) -> StorageResult<CycleRecord> {
        let record = self
            .fetch_cycle(run_id)
            .await?
            .ok_or_else(|| StorageError::CycleNotFound {
                run_id: run_id.to_string(),
            })?;
        record.verify()?;
        Ok(record)
    }

    async fn list_cycles(&self, filter: &CycleFilter) -> StorageResult<Vec<CycleRecord>> {
        let mut res = self
            .db
            .query(format!("SELECT {CYCLE_FIELDS} FROM cycles"))
            .await?;
        let rows: Vec<DbCycle> = res.take(0)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn put_signal(&self, signal: SignalRecord) -> StorageResult<()> {
        let row = DbSignal::from_record(&signal)?;
        self.db
            .query("CREATE type::thing('signals', $sid) CONTENT $row")
            .bind(("sid", signal.signal_id.clone()))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn list_signals(&self, run_id: &str, kind: &str) -> StorageResult<Vec<SignalRecord>> {
        let rows = self.fetch_signals(run_id, kind).await?;
        let mut out = rows
            .into_iter()
            .map(DbSignal::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(out)
    }

    async fn take_signals(&self, run_id: &str, kind: &str) -> StorageResult<Vec<SignalRecord>> {
        let rows = self.fetch_signals(run_id, kind).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|r| r.signal_id.clone()).collect();
        self.db
            .query("DELETE signals WHERE signal_id INSIDE $ids")
            .bind(("ids", ids))
            .await?
            .check()?;

        let mut out = rows
            .into_iter()
            .map(DbSignal::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(out)
    }
}

#[async_trait]
impl ScheduleStore for SurrealStateStore {
    async fn create_schedule(&self, record: ScheduleRecord) -> StorageResult<ScheduleRecord> {
        if self.fetch_schedule(&record.schedule_id).await?.is_some() {
            return Err(StorageError::ScheduleExists {
                schedule_id: record.schedule_id,
            });
        }
        self.write_schedule(DbSchedule::from_record(&record)?).await?;
        Ok(record)
    }

    async fn upsert_schedule(&self, record: ScheduleRecord) -> StorageResult<bool> {
        match self.fetch_schedule(&record.schedule_id).await? {
            Some(mut existing) => {
                existing.spec_json = serde_json::to_string(&record.spec)?;
                existing.note = record.note;
                existing.paused = record.paused;
                existing.updated_at = ts(&Utc::now());
                self.write_schedule(existing).await?;
                Ok(false)
            }
            None => {
                self.write_schedule(DbSchedule::from_record(&record)?).await?;
                Ok(true)
            }
        }
    }

    async fn get_schedule(&self, schedule_id: &str) -> StorageResult<Option<ScheduleRecord>> {
        self.fetch_schedule(schedule_id)
            .await?
            .map(DbSchedule::into_record)
            .transpose()
    }

    async fn delete_schedule(&self, schedule_id: &str) -> StorageResult<()> {
        if self.fetch_schedule(schedule_id).await?.is_none() {
            return Err(StorageError::ScheduleNotFound {
                schedule_id: schedule_id.to_string(),
            });
        }
        self.db
            .query("DELETE schedules WHERE schedule_id = $sid")
            .bind(("sid", schedule_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn list_schedules(&self) -> StorageResult<Vec<ScheduleRecord>> {
        let mut res = self
            .db
            .query(format!("SELECT {SCHEDULE_FIELDS} FROM schedules"))
            .await?;
        let rows: Vec<DbSchedule> = res.take(0)?;
        let mut out = rows
            .into_iter()
            .map(DbSchedule::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.schedule_id.cmp(&b.schedule_id));
        Ok(out)
    }

    async fn record_firing(
        &self,
        schedule_id: &str,
        run_id: &str,
        fired_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut row = self.fetch_schedule(schedule_id).await?.ok_or_else(|| {
            StorageError::ScheduleNotFound {
                schedule_id: schedule_id.to_string(),
            }
        })?;
        row.last_fired_at = Some(ts(&fired_at));
        row.last_run_id = Some(run_id.to_string());
        self.write_schedule(row).await
    }
}
