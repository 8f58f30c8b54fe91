//! SurrealDB schema setup for the repair agent's durable state
//!
//! Safe to call on every connection (DEFINE statements are idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all repair-agent tables.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing repair-agent SurrealDB schema");

    init_cycles_table(db).await?;
    init_signals_table(db).await?;
    init_schedules_table(db).await?;

    info!("Repair-agent schema initialization complete");
    Ok(())
}

/// `cycles` holds the latest snapshot per run.
///
/// ```text
/// TABLE cycles {
///   run_id:          STRING (record id, unique)
///   correlation_id:  STRING?
///   phase:           STRING
///   terminal:        BOOL (indexed)
///   state_json:      STRING (canonical JSON of the cycle state)
///   digest:          STRING (sha256 of state_json)
///   updated_at:      STRING (RFC 3339)
///   owner:           STRING? (host holding the lease)
///   lease_expires_at: STRING? (RFC 3339, compared as text)
///   version:         INT (bumped by every accepted write)
/// }
/// ```
async fn init_cycles_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing cycles table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS cycles SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_cycle_run_id ON TABLE cycles COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_cycle_correlation ON TABLE cycles COLUMNS correlation_id;
        DEFINE INDEX IF NOT EXISTS idx_cycle_terminal ON TABLE cycles COLUMNS terminal;
    "#;

    run_ddl(db, sql, "cycles").await
}

/// `signals` is the per-run inbox; rows are deleted when taken.
async fn init_signals_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing signals table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS signals SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_signal_id ON TABLE signals COLUMNS signal_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_signal_run_kind ON TABLE signals COLUMNS run_id, kind;
    "#;

    run_ddl(db, sql, "signals").await
}

async fn init_schedules_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing schedules table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS schedules SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_schedule_id ON TABLE schedules COLUMNS schedule_id UNIQUE;
    "#;

    run_ddl(db, sql, "schedules").await
}

async fn run_ddl(db: &Surreal<Any>, sql: &str, table: &str) -> StorageResult<()> {
    let res = db
        .query(sql)
        .await
        .map_err(|e| StorageError::SchemaSetup(format!("{table}: {e}")))?;
    res.check()
        .map_err(|e| StorageError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}
