//! In-memory adapter backed by a versioned table.
//!
//! This is the reference adapter used by the test suite and by hosts that
//! want to dry-run a job before pointing it at real remotes. Every write
//! bumps a table-wide version counter; cursors are that counter rendered
//! as a decimal watermark, which makes `get_updates` trivially monotonic.
//!
//! The adapter also carries test instrumentation: an injectable failure
//! plan for `apply_changes` and call/cursor spies, so failure and retry
//! behavior can be scripted without a network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{Adapter, AdapterError};
use crate::record::{ChangeSet, Cursor, Record};

#[derive(Default)]
struct TableState {
    /// Live rows: id -> (version written at, record).
    rows: BTreeMap<String, (u64, Record)>,
    /// Deleted rows: id -> version deleted at.
    tombstones: BTreeMap<String, u64>,
    /// Table-wide monotonic write counter.
    version: u64,
}

#[derive(Default)]
struct FailPlan {
    /// Fail this many upcoming `apply_changes` calls, then recover.
    remaining: u32,
    /// Fail every `apply_changes` call until cleared.
    always: bool,
}

pub struct MemoryAdapter {
    state: Mutex<TableState>,
    fail_plan: Mutex<FailPlan>,
    pull_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    cursors_seen: Mutex<Vec<Option<String>>>,
}

impl MemoryAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            fail_plan: Mutex::new(FailPlan::default()),
            pull_calls: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
            cursors_seen: Mutex::new(Vec::new()),
        }
    }

    /// Write a record as if a user edited it on the remote.
    pub fn upsert_local(&self, record: Record) {
        let mut state = self.state.lock();
        state.version += 1;
        let version = state.version;
        state.tombstones.remove(&record.id);
        state.rows.insert(record.id.clone(), (version, record));
    }

    /// Delete a record as if a user removed it on the remote.
    pub fn delete_local(&self, id: &str) {
        let mut state = self.state.lock();
        if state.rows.remove(id).is_some() {
            state.version += 1;
            let version = state.version;
            state.tombstones.insert(id.to_string(), version);
        }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().rows.contains_key(id)
    }

    #[must_use]
    pub fn record(&self, id: &str) -> Option<Record> {
        self.state.lock().rows.get(id).map(|(_, r)| r.clone())
    }

    /// Number of live rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().rows.is_empty()
    }

    // --- Failure scripting ---

    /// Make the next `n` calls to `apply_changes` fail with a transport error.
    pub fn fail_next_applies(&self, n: u32) {
        self.fail_plan.lock().remaining = n;
    }

    /// Make every call to `apply_changes` fail until [`Self::heal`] is called.
    pub fn fail_applies_forever(&self) {
        self.fail_plan.lock().always = true;
    }

    /// Clear any failure plan.
    pub fn heal(&self) {
        *self.fail_plan.lock() = FailPlan::default();
    }

    // --- Spies ---

    #[must_use]
    pub fn pull_count(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Cursor tokens `get_updates` has been invoked with, in call order.
    #[must_use]
    pub fn cursors_seen(&self) -> Vec<Option<String>> {
        self.cursors_seen.lock().clone()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn get_updates(&self, cursor: &Cursor) -> Result<(ChangeSet, Cursor), AdapterError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.cursors_seen.lock().push(cursor.value.clone());

        let from = match &cursor.value {
            None => 0,
            Some(token) => token
                .parse::<u64>()
                .map_err(|_| AdapterError::Validation(format!("bad cursor token '{token}'")))?,
        };

        let state = self.state.lock();
        let upserts: Vec<Record> = state
            .rows
            .values()
            .filter(|(v, _)| *v > from)
            .map(|(_, r)| r.clone())
            .collect();
        let deletes: Vec<String> = state
            .tombstones
            .iter()
            .filter(|(_, v)| **v > from)
            .map(|(id, _)| id.clone())
            .collect();

        debug!(
            from,
            watermark = state.version,
            upserts = upserts.len(),
            deletes = deletes.len(),
            "memory adapter pull"
        );

        Ok((
            ChangeSet { upserts, deletes },
            Cursor::at(state.version.to_string()),
        ))
    }

    async fn apply_changes(&self, changes: &ChangeSet) -> Result<(), AdapterError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut plan = self.fail_plan.lock();
            if plan.always {
                return Err(AdapterError::Transport("scripted outage".into()));
            }
            if plan.remaining > 0 {
                plan.remaining -= 1;
                return Err(AdapterError::Transport(format!(
                    "scripted failure ({} more)",
                    plan.remaining
                )));
            }
        }

        let mut state = self.state.lock();
        for record in &changes.upserts {
            state.version += 1;
            let version = state.version;
            state.tombstones.remove(&record.id);
            state.rows.insert(record.id.clone(), (version, record.clone()));
        }
        for id in &changes.deletes {
            // Deleting an absent or already-deleted row is a no-op, which
            // keeps delete propagation from echoing forever.
            if state.rows.remove(id).is_some() {
                state.version += 1;
                let version = state.version;
                state.tombstones.insert(id.clone(), version);
            }
        }
        Ok(())
    }

    fn serialize_cursor(&self, cursor: &Cursor) -> String {
        cursor.value.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: &str) -> Record {
        Record::new(id, json!({"id": id}))
    }

    #[tokio::test]
    async fn test_initial_pull_returns_snapshot() {
        let adapter = MemoryAdapter::new();
        adapter.upsert_local(rec("a"));
        adapter.upsert_local(rec("b"));

        let (changes, next) = adapter.get_updates(&Cursor::initial()).await.unwrap();
        assert_eq!(changes.upserts.len(), 2);
        assert!(changes.deletes.is_empty());
        assert_eq!(next.value.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_pull_is_incremental() {
        let adapter = MemoryAdapter::new();
        adapter.upsert_local(rec("a"));

        let (_, cursor) = adapter.get_updates(&Cursor::initial()).await.unwrap();

        let (changes, _) = adapter.get_updates(&cursor).await.unwrap();
        assert!(changes.is_empty());

        adapter.upsert_local(rec("b"));
        let (changes, next) = adapter.get_updates(&cursor).await.unwrap();
        assert_eq!(changes.upserts.len(), 1);
        assert_eq!(changes.upserts[0].id, "b");
        assert_eq!(next.value.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_pull_same_cursor_is_monotonic() {
        let adapter = MemoryAdapter::new();
        adapter.upsert_local(rec("a"));

        let (first, _) = adapter.get_updates(&Cursor::initial()).await.unwrap();
        adapter.upsert_local(rec("b"));
        let (second, _) = adapter.get_updates(&Cursor::initial()).await.unwrap();

        // Superset: everything in the first result is still in the second.
        for r in &first.upserts {
            assert!(second.upserts.iter().any(|s| s.id == r.id));
        }
    }

    #[tokio::test]
    async fn test_deletes_appear_after_cursor() {
        let adapter = MemoryAdapter::new();
        adapter.upsert_local(rec("a"));
        let (_, cursor) = adapter.get_updates(&Cursor::initial()).await.unwrap();

        adapter.delete_local("a");
        let (changes, _) = adapter.get_updates(&cursor).await.unwrap();
        assert_eq!(changes.deletes, vec!["a".to_string()]);
        assert!(changes.upserts.is_empty());
    }

    #[tokio::test]
    async fn test_apply_upserts_and_deletes() {
        let adapter = MemoryAdapter::new();
        let changes = ChangeSet {
            upserts: vec![rec("x"), rec("y")],
            deletes: vec![],
        };
        adapter.apply_changes(&changes).await.unwrap();
        assert_eq!(adapter.len(), 2);

        let changes = ChangeSet {
            upserts: vec![],
            deletes: vec!["x".into()],
        };
        adapter.apply_changes(&changes).await.unwrap();
        assert!(!adapter.contains("x"));
        assert!(adapter.contains("y"));
    }

    #[tokio::test]
    async fn test_redundant_delete_does_not_advance_watermark() {
        let adapter = MemoryAdapter::new();
        adapter.upsert_local(rec("a"));
        adapter.delete_local("a");
        let (_, cursor) = adapter.get_updates(&Cursor::initial()).await.unwrap();

        // Deleting again is a no-op; nothing new to report.
        adapter
            .apply_changes(&ChangeSet {
                upserts: vec![],
                deletes: vec!["a".into()],
            })
            .await
            .unwrap();

        let (changes, _) = adapter.get_updates(&cursor).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failures_then_recovery() {
        let adapter = MemoryAdapter::new();
        adapter.fail_next_applies(2);

        let changes = ChangeSet {
            upserts: vec![rec("a")],
            deletes: vec![],
        };
        assert!(adapter.apply_changes(&changes).await.is_err());
        assert!(adapter.apply_changes(&changes).await.is_err());
        assert!(adapter.apply_changes(&changes).await.is_ok());
        assert_eq!(adapter.apply_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_until_heal() {
        let adapter = MemoryAdapter::new();
        adapter.fail_applies_forever();

        let changes = ChangeSet::new();
        assert!(adapter.apply_changes(&changes).await.is_err());
        assert!(adapter.apply_changes(&changes).await.is_err());

        adapter.heal();
        assert!(adapter.apply_changes(&changes).await.is_ok());
    }

    #[tokio::test]
    async fn test_cursor_spy_records_tokens() {
        let adapter = MemoryAdapter::new();
        adapter.upsert_local(rec("a"));

        let (_, cursor) = adapter.get_updates(&Cursor::initial()).await.unwrap();
        let _ = adapter.get_updates(&cursor).await.unwrap();

        let seen = adapter.cursors_seen();
        assert_eq!(seen, vec![None, Some("1".to_string())]);
        assert_eq!(adapter.pull_count(), 2);
    }

    #[tokio::test]
    async fn test_bad_cursor_token_rejected() {
        let adapter = MemoryAdapter::new();
        let result = adapter.get_updates(&Cursor::at("not-a-number")).await;
        assert!(matches!(result, Err(AdapterError::Validation(_))));
    }

    #[test]
    fn test_serialize_cursor_roundtrip() {
        let adapter = MemoryAdapter::new();
        assert_eq!(adapter.serialize_cursor(&Cursor::at("17")), "17");
        assert_eq!(adapter.serialize_cursor(&Cursor::initial()), "");
    }
}
