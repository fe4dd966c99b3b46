//! Adapter contract: the uniform pull/push interface over a remote collection.
//!
//! One adapter instance represents one remote table or collection. Adapter
//! discovery and construction are host concerns; the engine receives
//! ready-to-use trait objects.

pub mod memory;

pub use memory::MemoryAdapter;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{ChangeSet, Cursor};

/// Errors raised by adapters.
///
/// The engine treats every variant as retryable; the taxonomy exists for
/// log readability, not for routing.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("remote validation failed: {0}")]
    Validation(String),
    #[error("rate limited by remote: {0}")]
    RateLimited(String),
}

/// One remote collection.
///
/// Implementations choose their own cursor format (offset token, watermark
/// timestamp, version counter); the engine only round-trips it.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Return all changes observed since `cursor` plus a cursor advancing
    /// past them.
    ///
    /// Must be monotonic: repeated calls with the same cursor return a
    /// superset of the previous result and never changes older than
    /// `cursor`. A [`Cursor::initial()`] cursor yields the full snapshot.
    async fn get_updates(&self, cursor: &Cursor) -> Result<(ChangeSet, Cursor), AdapterError>;

    /// Idempotently create/update the upserts and delete the deletes.
    ///
    /// Batch slicing happens in the engine; the changeset handed in here is
    /// already at most one push batch.
    async fn apply_changes(&self, changes: &ChangeSet) -> Result<(), AdapterError>;

    /// Render a cursor as a token the link index can store and hand back.
    fn serialize_cursor(&self, cursor: &Cursor) -> String;
}
