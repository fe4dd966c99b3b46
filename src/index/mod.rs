//! Link index: the durable ground truth for cross-system identity.
//!
//! The link index owns five logical tables: links, cursors (with per-side
//! fail counts and disablement), runs, and conflicts. It is the single
//! serialization point for cross-cycle state; everything else the engine
//! holds is per-cycle and disposable.
//!
//! Two backends ship: [`MemoryLinkIndex`] for tests and dry runs, and
//! [`SqlLinkIndex`] (SQLite by default, MySQL for shared deployments).

pub mod memory;
pub mod sql;

pub use memory::MemoryLinkIndex;
pub use sql::SqlLinkIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::Cursor;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("link index backend error: {0}")]
    Backend(String),
    #[error("link index connection error: {0}")]
    Connection(String),
}

/// One endpoint of a sync job: an adapter name plus a table/collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SideRef {
    pub adapter: String,
    pub table: String,
}

impl SideRef {
    pub fn new(adapter: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            table: table.into(),
        }
    }

    /// Qualify a record id into this side's namespace.
    #[must_use]
    pub fn entity(&self, id: impl Into<String>) -> EntityRef {
        EntityRef {
            adapter: self.adapter.clone(),
            table: self.table.clone(),
            id: id.into(),
        }
    }
}

/// A fully-qualified record identity: (adapter, table, id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub adapter: String,
    pub table: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(
        adapter: impl Into<String>,
        table: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            adapter: adapter.into(),
            table: table.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.adapter, self.table, self.id)
    }
}

/// A record pair parked for operator resolution under the `manual` policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub job_id: String,
    pub src: EntityRef,
    pub dest: EntityRef,
    pub src_payload: Value,
    pub dest_payload: Value,
    /// Epoch milliseconds.
    pub detected_at: i64,
}

/// Outcome classification of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No errors recorded.
    Success,
    /// Errors recorded, but at least one direction made progress.
    Partial,
    /// Errors and zero progress.
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub job_id: String,
    /// Epoch milliseconds.
    pub started_at: i64,
    /// Epoch milliseconds.
    pub ended_at: i64,
    pub status: RunStatus,
    pub summary_json: String,
}

impl RunSummary {
    /// Deserialize the stats payload, if it parses.
    #[must_use]
    pub fn stats(&self) -> Option<crate::engine::RunStats> {
        serde_json::from_str(&self.summary_json).ok()
    }
}

/// Durable store of links, cursors, fail counts, conflicts, and runs.
///
/// Invariants every backend must hold:
///
/// - **Symmetry**: after `upsert_link(s, d)`, `find_dest(s)` yields `d.id`
///   and `find_source(d)` yields `s.id`, and lookups work from either
///   orientation of the stored pair.
/// - **No half-links**: `upsert_link` atomically breaks any previous
///   binding touching either endpoint; a reader sees the old binding or
///   the new one, never a mix.
///
/// The backing store is single-writer in v1 (one engine per job).
#[async_trait]
pub trait LinkIndex: Send + Sync {
    /// Atomically install or replace the bidirectional binding `src <-> dest`.
    async fn upsert_link(&self, src: &EntityRef, dest: &EntityRef) -> Result<(), IndexError>;

    /// The destination id bound to `src`, if any.
    async fn find_dest(&self, src: &EntityRef) -> Result<Option<String>, IndexError>;

    /// The source id bound to `dest`, if any.
    async fn find_source(&self, dest: &EntityRef) -> Result<Option<String>, IndexError>;

    /// The stored cursor for one side of a job; `Cursor::initial()` if absent.
    async fn load_cursor(&self, job: &str, adapter: &str, table: &str)
        -> Result<Cursor, IndexError>;

    async fn save_cursor(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
        cursor: &Cursor,
    ) -> Result<(), IndexError>;

    async fn is_job_disabled(&self, job: &str) -> Result<bool, IndexError>;

    /// Persistently disable a job; cleared only by operator action.
    async fn set_job_disabled(&self, job: &str, ts_millis: i64) -> Result<(), IndexError>;

    /// Bump one side's consecutive-failure counter and return the new count.
    async fn increment_fail_count(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<u32, IndexError>;

    async fn reset_fail_count(&self, job: &str, adapter: &str, table: &str)
        -> Result<(), IndexError>;

    async fn get_fail_count(&self, job: &str, adapter: &str, table: &str)
        -> Result<u32, IndexError>;

    async fn insert_conflict(&self, conflict: &Conflict) -> Result<(), IndexError>;

    async fn get_conflicts(&self, job: &str) -> Result<Vec<Conflict>, IndexError>;

    /// Idempotent delete; resolving an unknown id is a no-op.
    async fn resolve_conflict(&self, conflict_id: &str) -> Result<(), IndexError>;

    /// Append one run record.
    async fn insert_run(&self, run: &RunSummary) -> Result<(), IndexError>;

    /// Run history for a job, oldest first.
    async fn get_runs(&self, job: &str) -> Result<Vec<RunSummary>, IndexError>;
}
