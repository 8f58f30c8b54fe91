//! Repair-State: durable state for the order repair agent
//!
//! This crate is the durable-execution substrate. Every cycle snapshot, every
//! approval signal and every schedule definition goes through it, so a cycle
//! can be resumed after the process that started it has gone away.
//!
//! ## Key Components
//!
//! - `CycleStore`: latest snapshot per run plus a per-run signal inbox
//! - `ScheduleStore`: scheduled trigger definitions
//! - `SurrealStateStore`: SurrealDB implementation (`mem://`, `surrealkv://`, `ws://`)
//! - `MemoryStateStore`: in-memory fake for tests

mod error;
pub mod fakes;
pub mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use fakes::MemoryStateStore;
pub use storage_traits::{
    write_conflict, ContentDigest, CycleFilter, CycleRecord, CycleStore, ScheduleRecord,
    ScheduleStore, SignalRecord, StateStore, StorageResult,
};
pub use surreal_store::SurrealStateStore;
