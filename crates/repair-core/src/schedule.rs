//! Time-based triggers: each firing starts exactly one cycle.
//!
//! Definitions live in the [`ScheduleStore`]; the [`Scheduler`] tick loop
//! fires the due ones. A firing is skipped while the previous run of the
//! same schedule is still unfinished.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use repair_state::{ScheduleRecord, ScheduleStore, StateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CycleConfig;
use crate::domain::{RepairError, Result};
use crate::obs;
use crate::orchestrator::RepairOrchestrator;

/// A schedule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub schedule_id: String,
    pub every: Duration,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

impl ScheduleSpec {
    pub fn new(schedule_id: impl Into<String>, every: Duration) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            every,
            cycle: CycleConfig::default(),
            note: None,
            paused: false,
        }
    }

    pub fn with_cycle(mut self, cycle: CycleConfig) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.schedule_id.trim().is_empty() {
            return Err(RepairError::InvalidConfig("schedule id must not be empty".into()));
        }
        if self.every.is_zero() {
            return Err(RepairError::InvalidConfig("schedule interval must be positive".into()));
        }
        self.cycle.validate()
    }

    fn to_record(&self) -> Result<ScheduleRecord> {
        let mut record = ScheduleRecord::new(&self.schedule_id, serde_json::to_value(self)?, self.note.clone());
        record.paused = self.paused;
        Ok(record)
    }
}

/// A stored schedule with its firing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleView {
    pub spec: ScheduleSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
}

impl ScheduleView {
    fn from_record(record: ScheduleRecord) -> Result<Self> {
        let mut spec: ScheduleSpec = serde_json::from_value(record.spec)?;
        // Record columns win over the embedded copy.
        spec.schedule_id = record.schedule_id;
        spec.note = record.note;
        spec.paused = record.paused;
        Ok(Self {
            spec,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_fired_at: record.last_fired_at,
            last_run_id: record.last_run_id,
        })
    }

    /// When the next firing is due, counted from the last firing or creation.
    pub fn next_due_at(&self) -> DateTime<Utc> {
        let base = self.last_fired_at.unwrap_or(self.created_at);
        chrono::Duration::from_std(self.spec.every)
            .ok()
            .and_then(|every| base.checked_add_signed(every))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.spec.paused && now >= self.next_due_at()
    }
}

/// Outcome of one firing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FireResult {
    Fired { run_id: String },
    /// The previous run of this schedule has not finished.
    SkippedOverlap { previous_run_id: String },
    Paused,
    NotDue,
    Failed { error: String },
}

/// CRUD and manual firing of schedules.
#[derive(Debug, Clone)]
pub struct ScheduleManager {
    orchestrator: RepairOrchestrator,
}

impl ScheduleManager {
    pub fn new(orchestrator: RepairOrchestrator) -> Self {
        Self { orchestrator }
    }

    fn store(&self) -> Arc<dyn StateStore> {
        self.orchestrator.store()
    }

    /// Fails with [`RepairError::ScheduleExists`] if the id is taken.
    pub async fn create(&self, spec: ScheduleSpec) -> Result<ScheduleView> {
        spec.validate()?;
        let record = self.store().create_schedule(spec.to_record()?).await?;
        info!(schedule_id = %spec.schedule_id, every_secs = spec.every.as_secs(), "schedule created");
        ScheduleView::from_record(record)
    }

    /// Create, or update an existing schedule keeping its history.
    /// Returns `true` when the schedule was newly created.
    pub async fn upsert(&self, spec: ScheduleSpec) -> Result<bool> {
        spec.validate()?;
        let created = self.store().upsert_schedule(spec.to_record()?).await?;
        info!(schedule_id = %spec.schedule_id, created, "schedule upserted");
        Ok(created)
    }

    pub async fn describe(&self, schedule_id: &str) -> Result<ScheduleView> {
        let record = self
            .store()
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| RepairError::ScheduleNotFound {
                schedule_id: schedule_id.to_string(),
            })?;
        ScheduleView::from_record(record)
    }

    pub async fn delete(&self, schedule_id: &str) -> Result<()> {
        self.store().delete_schedule(schedule_id).await?;
        info!(schedule_id = %schedule_id, "schedule deleted");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ScheduleView>> {
        self.store()
            .list_schedules()
            .await?
            .into_iter()
            .map(ScheduleView::from_record)
            .collect()
    }

    /// Fire a schedule now, whether or not it is due.
    pub async fn trigger(&self, schedule_id: &str) -> Result<FireResult> {
        let view = self.describe(schedule_id).await?;
        self.fire(&view, Utc::now()).await
    }

    async fn fire(&self, view: &ScheduleView, now: DateTime<Utc>) -> Result<FireResult> {
        let schedule_id = &view.spec.schedule_id;
        if let Some(previous) = &view.last_run_id {
            match self.orchestrator.query_status(previous).await {
                Ok(status) if !status.is_terminal() => {
                    info!(schedule_id = %schedule_id, previous_run_id = %previous, "previous run unfinished; skipping firing");
                    return Ok(FireResult::SkippedOverlap {
                        previous_run_id: previous.clone(),
                    });
                }
                Ok(_) | Err(RepairError::RunNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let run_id = format!("{}-{}", schedule_id, now.timestamp());
        self.orchestrator
            .start(&run_id, view.spec.cycle.clone(), Some(schedule_id.clone()))
            .await?;
        self.store().record_firing(schedule_id, &run_id, now).await?;
        obs::emit_schedule_fired(schedule_id, &run_id);
        Ok(FireResult::Fired { run_id })
    }
}

/// Fires due schedules on a fixed tick.
#[derive(Debug, Clone)]
pub struct Scheduler {
    manager: ScheduleManager,
    tick: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: RepairOrchestrator, tick: Duration) -> Self {
        Self {
            manager: ScheduleManager::new(orchestrator),
            tick,
        }
    }

    pub fn manager(&self) -> &ScheduleManager {
        &self.manager
    }

    /// Evaluate every schedule once against `now`.
    ///
    /// A failure to fire one schedule is reported in its result and does not
    /// stop the others.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<Vec<(String, FireResult)>> {
        let mut results = Vec::new();
        for view in self.manager.list().await? {
            let id = view.spec.schedule_id.clone();
            let result = if view.spec.paused {
                FireResult::Paused
            } else if !view.is_due(now) {
                FireResult::NotDue
            } else {
                match self.manager.fire(&view, now).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(schedule_id = %id, error = %e, "schedule firing failed");
                        FireResult::Failed { error: e.to_string() }
                    }
                }
            };
            debug!(schedule_id = %id, result = ?result, "schedule evaluated");
            results.push((id, result));
        }
        Ok(results)
    }

    /// Tick until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_secs = self.tick.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick_once(Utc::now()).await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentSet;
    use crate::config::RuleConfig;
    use crate::domain::DomainSnapshot;
    use crate::domain_store::MemoryDomainStore;
    use repair_state::MemoryStateStore;

    fn orchestrator() -> RepairOrchestrator {
        RepairOrchestrator::new(
            AgentSet::rule_based(RuleConfig::default()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryDomainStore::new(DomainSnapshot::default())),
        )
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let manager = ScheduleManager::new(orchestrator());
        let spec = ScheduleSpec::new("nightly", Duration::from_secs(3600));
        manager.create(spec.clone()).await.unwrap();
        let err = manager.create(spec).await.unwrap_err();
        assert!(matches!(err, RepairError::ScheduleExists { .. }));
    }

    #[tokio::test]
    async fn test_upsert_keeps_creation_time() {
        let manager = ScheduleManager::new(orchestrator());
        let spec = ScheduleSpec::new("nightly", Duration::from_secs(3600));
        assert!(manager.upsert(spec.clone()).await.unwrap());
        let before = manager.describe("nightly").await.unwrap();

        let updated = spec.with_note("moved").with_paused(true);
        assert!(!manager.upsert(updated).await.unwrap());
        let after = manager.describe("nightly").await.unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.spec.note.as_deref(), Some("moved"));
        assert!(after.spec.paused);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let manager = ScheduleManager::new(orchestrator());
        let err = manager
            .create(ScheduleSpec::new("bad", Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, RepairError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_describe_missing() {
        let manager = ScheduleManager::new(orchestrator());
        let err = manager.describe("nope").await.unwrap_err();
        assert!(matches!(err, RepairError::ScheduleNotFound { .. }));
    }

    #[tokio::test]
    async fn test_tick_fires_only_due_schedules() {
        let scheduler = Scheduler::new(orchestrator(), Duration::from_secs(1));
        let manager = scheduler.manager();
        manager
            .create(ScheduleSpec::new("hourly", Duration::from_secs(3600)))
            .await
            .unwrap();
        manager
            .create(ScheduleSpec::new("held", Duration::from_secs(60)).with_paused(true))
            .await
            .unwrap();

        let results = scheduler.tick_once(Utc::now()).await.unwrap();
        assert!(results
            .iter()
            .any(|(id, r)| id == "hourly" && *r == FireResult::NotDue));
        assert!(results
            .iter()
            .any(|(id, r)| id == "held" && *r == FireResult::Paused));

        let later = Utc::now() + chrono::Duration::hours(2);
        let results = scheduler.tick_once(later).await.unwrap();
        let (_, fired) = results.iter().find(|(id, _)| id == "hourly").unwrap();
        let expected = format!("hourly-{}", later.timestamp());
        assert_eq!(*fired, FireResult::Fired { run_id: expected.clone() });

        let view = manager.describe("hourly").await.unwrap();
        assert_eq!(view.last_run_id.as_deref(), Some(expected.as_str()));
        assert_eq!(view.last_fired_at, Some(later));
    }

    #[test]
    fn test_next_due_counts_from_last_firing() {
        let created = Utc::now();
        let fired = created + chrono::Duration::minutes(90);
        let view = ScheduleView {
            spec: ScheduleSpec::new("s", Duration::from_secs(3600)),
            created_at: created,
            updated_at: created,
            last_fired_at: Some(fired),
            last_run_id: None,
        };
        assert_eq!(view.next_due_at(), fired + chrono::Duration::hours(1));
        assert!(!view.is_due(fired + chrono::Duration::minutes(59)));
        assert!(view.is_due(fired + chrono::Duration::minutes(60)));
    }
}
