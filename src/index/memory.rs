//! In-memory link index for tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Conflict, EntityRef, IndexError, LinkIndex, RunSummary};
use crate::record::Cursor;

type CursorKey = (String, String, String);

#[derive(Default)]
struct CursorRow {
    token: Option<String>,
    fail_count: u32,
}

#[derive(Default)]
pub struct MemoryLinkIndex {
    /// Both orientations of every link are stored, so a lookup from either
    /// side is a single map probe.
    links: Mutex<HashMap<EntityRef, EntityRef>>,
    cursors: Mutex<HashMap<CursorKey, CursorRow>>,
    disabled: Mutex<HashMap<String, i64>>,
    conflicts: Mutex<Vec<Conflict>>,
    runs: Mutex<Vec<RunSummary>>,
}

impl MemoryLinkIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of installed links (pairs, not orientations).
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.lock().len() / 2
    }
}

fn key(job: &str, adapter: &str, table: &str) -> CursorKey {
    (job.to_string(), adapter.to_string(), table.to_string())
}

#[async_trait]
impl LinkIndex for MemoryLinkIndex {
    async fn upsert_link(&self, src: &EntityRef, dest: &EntityRef) -> Result<(), IndexError> {
        let mut links = self.links.lock();
        // Break any binding touching either endpoint before installing the
        // new pair, so no half-link survives.
        if let Some(old_dest) = links.remove(src) {
            links.remove(&old_dest);
        }
        if let Some(old_src) = links.remove(dest) {
            links.remove(&old_src);
        }
        links.insert(src.clone(), dest.clone());
        links.insert(dest.clone(), src.clone());
        Ok(())
    }

    async fn find_dest(&self, src: &EntityRef) -> Result<Option<String>, IndexError> {
        Ok(self.links.lock().get(src).map(|d| d.id.clone()))
    }

    async fn find_source(&self, dest: &EntityRef) -> Result<Option<String>, IndexError> {
        Ok(self.links.lock().get(dest).map(|s| s.id.clone()))
    }

    async fn load_cursor(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<Cursor, IndexError> {
        let cursors = self.cursors.lock();
        Ok(cursors
            .get(&key(job, adapter, table))
            .and_then(|row| row.token.clone())
            .map_or_else(Cursor::initial, Cursor::at))
    }

    async fn save_cursor(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
        cursor: &Cursor,
    ) -> Result<(), IndexError> {
        let mut cursors = self.cursors.lock();
        cursors
            .entry(key(job, adapter, table))
            .or_default()
            .token = cursor.value.clone();
        Ok(())
    }

    async fn is_job_disabled(&self, job: &str) -> Result<bool, IndexError> {
        Ok(self.disabled.lock().contains_key(job))
    }

    async fn set_job_disabled(&self, job: &str, ts_millis: i64) -> Result<(), IndexError> {
        self.disabled.lock().insert(job.to_string(), ts_millis);
        Ok(())
    }

    async fn increment_fail_count(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<u32, IndexError> {
        let mut cursors = self.cursors.lock();
        let row = cursors.entry(key(job, adapter, table)).or_default();
        row.fail_count += 1;
        Ok(row.fail_count)
    }

    async fn reset_fail_count(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<(), IndexError> {
        if let Some(row) = self.cursors.lock().get_mut(&key(job, adapter, table)) {
            row.fail_count = 0;
        }
        Ok(())
    }

    async fn get_fail_count(
        &self,
        job: &str,
        adapter: &str,
        table: &str,
    ) -> Result<u32, IndexError> {
        Ok(self
            .cursors
            .lock()
            .get(&key(job, adapter, table))
            .map_or(0, |row| row.fail_count))
    }

    async fn insert_conflict(&self, conflict: &Conflict) -> Result<(), IndexError> {
        self.conflicts.lock().push(conflict.clone());
        Ok(())
    }

    async fn get_conflicts(&self, job: &str) -> Result<Vec<Conflict>, IndexError> {
        Ok(self
            .conflicts
            .lock()
            .iter()
            .filter(|c| c.job_id == job)
            .cloned()
            .collect())
    }

    async fn resolve_conflict(&self, conflict_id: &str) -> Result<(), IndexError> {
        self.conflicts.lock().retain(|c| c.conflict_id != conflict_id);
        Ok(())
    }

    async fn insert_run(&self, run: &RunSummary) -> Result<(), IndexError> {
        self.runs.lock().push(run.clone());
        Ok(())
    }

    async fn get_runs(&self, job: &str) -> Result<Vec<RunSummary>, IndexError> {
        Ok(self
            .runs
            .lock()
            .iter()
            .filter(|r| r.job_id == job)
            .cloned()
            .collect())
    }
}
