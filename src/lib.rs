//! # SyncFrame
//!
//! A bidirectional, cursor-based synchronization engine that keeps two
//! remote record collections (say, an Airtable table and a Webflow
//! collection) eventually consistent without duplicates or sync loops.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    get_updates     ┌──────────────────────────────┐
//! │  Adapter A   │ ─────────────────► │                              │
//! └──────────────┘                    │         Sync engine          │
//! ┌──────────────┐    get_updates     │  pull → transform → push →   │
//! │  Adapter B   │ ─────────────────► │           persist            │
//! └──────────────┘                    │                              │
//!        ▲        apply_changes       └──────────────┬───────────────┘
//!        └────── (batched, throttled, ◄──────────────┤
//!                 retried)                           ▼
//!                                     ┌──────────────────────────────┐
//!                                     │          Link index          │
//!                                     │ links · cursors · fail counts│
//!                                     │ conflicts · runs · disabling │
//!                                     └──────────────────────────────┘
//! ```
//!
//! Records flow both ways under a common identity mapping held by the
//! durable link index. Echoes are suppressed twice over: a per-cycle set
//! stops the two directions of one cycle from bouncing a record back, and
//! a reverse link lookup stops a side from re-propagating our own earlier
//! write. When both sides change the same logical record in one cycle,
//! the conflict policy decides: `last_writer_wins` compares
//! `updatedAt`-class timestamps, `manual` parks the pair for an operator.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use syncframe::{
//!     IdentityMapper, MemoryAdapter, MemoryLinkIndex, Record, SideConfig, SyncEngine, SyncJob,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let airtable = Arc::new(MemoryAdapter::new());
//!     airtable.upsert_local(Record::new("rec-1", json!({"name": "Ada"})));
//!
//!     let job = SyncJob::new(
//!         "people-sync",
//!         SideConfig::new("airtable", "people", airtable),
//!         SideConfig::new("webflow", "members", Arc::new(MemoryAdapter::new())),
//!         Arc::new(IdentityMapper),
//!         Arc::new(IdentityMapper),
//!         Arc::new(MemoryLinkIndex::new()),
//!     );
//!
//!     let engine = SyncEngine::new(job);
//!     let summary = engine.run().await.expect("link index reachable");
//!     println!("{}: {}", summary.run_id, summary.status);
//! }
//! ```
//!
//! ## Failure model
//!
//! Remote failures never escape [`SyncEngine::run`]: pull and push errors
//! abort the cycle into a `failed` run summary, mapper errors skip single
//! records, and sustained failure on one side disables the job until an
//! operator intervenes. Push batches are throttled per side and retried
//! with exponential backoff.
//!
//! ## Modules
//!
//! - [`engine`]: the [`SyncEngine`] cycle orchestrator
//! - [`transform`]: mapping, echo suppression, conflict resolution
//! - [`index`]: the [`LinkIndex`] contract plus memory and SQL backends
//! - [`adapter`]: the [`Adapter`] contract plus the in-memory adapter
//! - [`mapper`]: per-direction record translation
//! - [`throttle`]: sliding-window rate limiting
//! - [`config`]: job descriptors and tuning knobs

pub mod adapter;
pub mod config;
pub mod engine;
pub mod index;
pub mod mapper;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod throttle;
pub mod transform;

pub use adapter::{Adapter, AdapterError, MemoryAdapter};
pub use config::{ConflictPolicy, RetryConfig, SideConfig, SyncJob, ThrottleConfig};
pub use engine::{CyclePhase, RunStats, SyncEngine};
pub use index::{
    Conflict, EntityRef, IndexError, LinkIndex, MemoryLinkIndex, RunStatus, RunSummary, SideRef,
    SqlLinkIndex,
};
pub use mapper::{IdentityMapper, MapError, Mapper};
pub use record::{ChangeSet, Cursor, Record};
pub use throttle::Throttler;
pub use transform::DirectionPlan;
