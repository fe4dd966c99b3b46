//! End-to-end engine scenarios over in-memory adapters and link index.
//!
//! Each test drives full cycles through [`SyncEngine::run`] and asserts on
//! remote contents, link-index state, and the persisted run summaries.
//!
//! Run with: `cargo test --test engine`

use std::sync::Arc;

use serde_json::json;

use syncframe::{
    ConflictPolicy, Cursor, IdentityMapper, LinkIndex, MemoryAdapter, MemoryLinkIndex, Record,
    RetryConfig, RunStats, RunStatus, SideConfig, SyncEngine, SyncJob,
};

const JOB: &str = "people-sync";

struct Harness {
    a: Arc<MemoryAdapter>,
    b: Arc<MemoryAdapter>,
    index: Arc<MemoryLinkIndex>,
    engine: SyncEngine,
}

fn harness_with(policy: ConflictPolicy, retry: RetryConfig) -> Harness {
    let a = Arc::new(MemoryAdapter::new());
    let b = Arc::new(MemoryAdapter::new());
    let index = Arc::new(MemoryLinkIndex::new());

    let job = SyncJob::new(
        JOB,
        SideConfig::new("airtable", "people", a.clone()),
        SideConfig::new("webflow", "members", b.clone()),
        Arc::new(IdentityMapper),
        Arc::new(IdentityMapper),
        index.clone(),
    )
    .with_conflict_policy(policy)
    .with_retry(retry);

    let engine = SyncEngine::new(job);
    Harness { a, b, index, engine }
}

fn harness() -> Harness {
    harness_with(ConflictPolicy::LastWriterWins, fast_retry())
}

/// Keep backoff out of test wall-clock time.
fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        backoff_secs: 0.01,
        disable_job_after: 20,
    }
}

fn rec(id: &str, updated_at: i64) -> Record {
    Record::new(id, json!({"updatedAt": updated_at, "origin": id.to_string()}))
}

fn stats(summary: &syncframe::RunSummary) -> RunStats {
    summary.stats().expect("summary_json parses")
}

#[tokio::test]
async fn basic_a_to_b() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    h.a.upsert_local(rec("a2", 100));

    let summary = h.engine.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert!(h.b.contains("a1") && h.b.contains("a2"));

    let s = stats(&summary);
    assert_eq!(s.upserts_a_to_b, 2);
    assert_eq!(s.upserts_b_to_a, 0);

    // Links exist, source side A.
    assert_eq!(h.index.link_count(), 2);
    for id in ["a1", "a2"] {
        let dest = h
            .index
            .find_dest(&syncframe::EntityRef::new("airtable", "people", id))
            .await
            .unwrap();
        assert_eq!(dest.as_deref(), Some(id));
    }
}

#[tokio::test]
async fn simultaneous_bootstrap() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    h.b.upsert_local(rec("b1", 100));

    let summary = h.engine.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    for id in ["a1", "b1"] {
        assert!(h.a.contains(id), "side A missing {id}");
        assert!(h.b.contains(id), "side B missing {id}");
    }
    assert_eq!(h.index.link_count(), 2);

    let s = stats(&summary);
    assert_eq!(s.upserts_a_to_b, 1);
    assert_eq!(s.upserts_b_to_a, 1);
}

#[tokio::test]
async fn second_cycle_is_idempotent() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    h.a.upsert_local(rec("a2", 100));

    h.engine.run().await.unwrap();
    let second = h.engine.run().await.unwrap();

    assert_eq!(second.status, RunStatus::Success);
    let s = stats(&second);
    assert_eq!(s.upserts_a_to_b, 0);
    assert_eq!(s.upserts_b_to_a, 0);
    assert_eq!(s.deletes_a_to_b + s.deletes_b_to_a, 0);

    assert_eq!(h.b.len(), 2);
    assert_eq!(h.index.link_count(), 2);
}

#[tokio::test]
async fn delete_propagates() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    h.a.upsert_local(rec("a2", 100));
    h.engine.run().await.unwrap();
    assert!(h.b.contains("a1"));

    h.a.delete_local("a1");
    let summary = h.engine.run().await.unwrap();

    assert!(!h.b.contains("a1"));
    assert!(h.b.contains("a2"));
    let s = stats(&summary);
    assert_eq!(s.deletes_a_to_b, 1);
}

#[tokio::test]
async fn lww_conflict_newer_destination_wins() {
    let h = harness();
    // Pair linked in an earlier life of the job.
    h.index
        .upsert_link(
            &syncframe::EntityRef::new("airtable", "people", "a1"),
            &syncframe::EntityRef::new("webflow", "members", "b1"),
        )
        .await
        .unwrap();

    // Both sides change the pair in the same cycle; B's copy is newer.
    h.a.upsert_local(Record::new("a1", json!({"updatedAt": 2000, "v": "from-a"})));
    h.b.upsert_local(Record::new("b1", json!({"updatedAt": 3000, "v": "from-b"})));

    let summary = h.engine.run().await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);

    let s = stats(&summary);
    // A -> B propagation skipped, B -> A propagated the newer payload.
    assert_eq!(s.upserts_a_to_b, 0);
    assert_eq!(s.upserts_b_to_a, 1);

    assert_eq!(h.b.record("b1").unwrap().fields["v"], "from-b");
    assert_eq!(h.a.record("a1").unwrap().fields["v"], "from-b");
}

#[tokio::test]
async fn manual_conflict_is_parked_not_pushed() {
    let h = harness_with(ConflictPolicy::Manual, fast_retry());
    h.index
        .upsert_link(
            &syncframe::EntityRef::new("airtable", "people", "a1"),
            &syncframe::EntityRef::new("webflow", "members", "b1"),
        )
        .await
        .unwrap();

    h.a.upsert_local(Record::new("a1", json!({"updatedAt": 2000, "v": "from-a"})));
    h.b.upsert_local(Record::new("b1", json!({"updatedAt": 3000, "v": "from-b"})));

    let summary = h.engine.run().await.unwrap();

    let s = stats(&summary);
    assert!(s.conflicts >= 1);

    // Neither side's copy moved.
    assert_eq!(h.a.record("a1").unwrap().fields["v"], "from-a");
    assert_eq!(h.b.record("b1").unwrap().fields["v"], "from-b");

    let conflicts = h.index.get_conflicts(JOB).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].src_payload["v"], "from-a");
    assert_eq!(conflicts[0].dest_payload["v"], "from-b");

    // Resolution clears the queue and is idempotent.
    h.index
        .resolve_conflict(&conflicts[0].conflict_id)
        .await
        .unwrap();
    h.index
        .resolve_conflict(&conflicts[0].conflict_id)
        .await
        .unwrap();
    assert!(h.index.get_conflicts(JOB).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_then_success() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    h.b.fail_next_applies(2);

    let summary = h.engine.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    let s = stats(&summary);
    assert_eq!(s.retries, 2);
    assert!(h.b.contains("a1"));
}

#[tokio::test]
async fn retries_exhausted_fails_cycle_and_counts_side() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    h.b.fail_applies_forever();

    let summary = h.engine.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    let s = stats(&summary);
    assert_eq!(s.retries, 2); // max_attempts = 3
    assert!(s.errors.iter().any(|e| e.contains("side B")));

    // Only the failing side is charged.
    assert_eq!(h.index.get_fail_count(JOB, "webflow", "members").await.unwrap(), 1);
    assert_eq!(h.index.get_fail_count(JOB, "airtable", "people").await.unwrap(), 0);

    // The cycle failed, so cursors did not advance.
    let cursor = h.index.load_cursor(JOB, "airtable", "people").await.unwrap();
    assert!(cursor.is_initial());
}

#[tokio::test]
async fn sustained_failure_disables_job() {
    let retry = RetryConfig {
        max_attempts: 1,
        backoff_secs: 0.01,
        disable_job_after: 3,
    };
    let h = harness_with(ConflictPolicy::LastWriterWins, retry);
    h.a.upsert_local(rec("a1", 100));
    h.b.fail_applies_forever();

    for _ in 0..3 {
        let summary = h.engine.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
    }
    assert!(h.index.is_job_disabled(JOB).await.unwrap());

    let pulls_before = h.a.pull_count();
    let applies_before = h.b.apply_count();

    let summary = h.engine.run().await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    let s = stats(&summary);
    assert_eq!(s.reason.as_deref(), Some("job_disabled"));

    // Preflight refused the cycle without touching either adapter.
    assert_eq!(h.a.pull_count(), pulls_before);
    assert_eq!(h.b.apply_count(), applies_before);
}

#[tokio::test]
async fn cursor_saved_and_replayed_across_cycles() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));

    h.engine.run().await.unwrap();

    // The saved token is what side A's pull returned.
    let saved = h.index.load_cursor(JOB, "airtable", "people").await.unwrap();
    assert_eq!(saved, Cursor::at("1"));

    h.a.upsert_local(rec("a3", 200));
    let summary = h.engine.run().await.unwrap();

    let seen = h.a.cursors_seen();
    assert_eq!(seen[0], None);
    assert_eq!(seen[1].as_deref(), Some("1"));

    // Only the new record moved.
    let s = stats(&summary);
    assert_eq!(s.upserts_a_to_b, 1);
    assert!(h.b.contains("a3"));
}

#[tokio::test]
async fn fail_counts_reset_after_success() {
    let retry = RetryConfig {
        max_attempts: 1,
        backoff_secs: 0.01,
        disable_job_after: 20,
    };
    let h = harness_with(ConflictPolicy::LastWriterWins, retry);
    h.a.upsert_local(rec("a1", 100));
    h.b.fail_next_applies(1);

    let failed = h.engine.run().await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(h.index.get_fail_count(JOB, "webflow", "members").await.unwrap(), 1);

    let recovered = h.engine.run().await.unwrap();
    assert_eq!(recovered.status, RunStatus::Success);
    assert_eq!(h.index.get_fail_count(JOB, "webflow", "members").await.unwrap(), 0);
    assert_eq!(h.index.get_fail_count(JOB, "airtable", "people").await.unwrap(), 0);
}

#[tokio::test]
async fn updates_never_create_second_destination() {
    // A pair linked across id namespaces: updates must keep landing on the
    // same destination record, never minting a new one.
    let h = harness();
    h.index
        .upsert_link(
            &syncframe::EntityRef::new("airtable", "people", "a1"),
            &syncframe::EntityRef::new("webflow", "members", "b1"),
        )
        .await
        .unwrap();
    h.b.upsert_local(Record::new("b1", json!({"updatedAt": 50})));

    for ts in [100, 200, 300] {
        h.a.upsert_local(rec("a1", ts));
        h.engine.run().await.unwrap();
    }

    assert_eq!(h.b.len(), 1, "updates must reuse the linked destination");
    assert_eq!(h.index.link_count(), 1);
    assert_eq!(h.b.record("b1").unwrap().fields["updatedAt"], 300);
    assert!(!h.b.contains("a1"));
}

#[tokio::test]
async fn pull_failure_aborts_and_names_the_side() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    // Poison side B's stored cursor so its pull rejects it.
    h.index
        .save_cursor(JOB, "webflow", "members", &Cursor::at("garbage"))
        .await
        .unwrap();

    let summary = h.engine.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    let s = stats(&summary);
    assert!(s.errors[0].contains("side B pull failed"));
    assert_eq!(h.index.get_fail_count(JOB, "webflow", "members").await.unwrap(), 1);
    assert_eq!(h.index.get_fail_count(JOB, "airtable", "people").await.unwrap(), 0);

    // Nothing was pushed anywhere.
    assert!(h.b.is_empty());
}

#[tokio::test]
async fn mapper_failures_are_partial_not_fatal() {
    use syncframe::{MapError, Mapper};

    /// Fails exactly one record id, passes the rest through.
    struct Picky;
    impl Mapper for Picky {
        fn to_dest(&self, record: &Record) -> Result<Record, MapError> {
            if record.id == "a-bad" {
                Err(MapError("unmappable field".into()))
            } else {
                Ok(record.clone())
            }
        }
        fn to_source(&self, record: &Record) -> Result<Record, MapError> {
            Ok(record.clone())
        }
    }

    let a = Arc::new(MemoryAdapter::new());
    let b = Arc::new(MemoryAdapter::new());
    let index = Arc::new(MemoryLinkIndex::new());
    let job = SyncJob::new(
        JOB,
        SideConfig::new("airtable", "people", a.clone()),
        SideConfig::new("webflow", "members", b.clone()),
        Arc::new(Picky),
        Arc::new(IdentityMapper),
        index.clone(),
    )
    .with_retry(fast_retry());
    let engine = SyncEngine::new(job);

    a.upsert_local(rec("a-bad", 100));
    a.upsert_local(rec("a-good", 100));

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.status, RunStatus::Partial);
    let s = stats(&summary);
    assert_eq!(s.upserts_a_to_b, 1);
    assert_eq!(s.errors.len(), 1);
    assert!(s.errors[0].contains("a-bad"));

    assert!(b.contains("a-good"));
    assert!(!b.contains("a-bad"));

    // Cursors advanced: the bad record will not wedge the job.
    let cursor = index.load_cursor(JOB, "airtable", "people").await.unwrap();
    assert!(!cursor.is_initial());
}

#[tokio::test]
async fn every_cycle_appends_exactly_one_run() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));

    h.engine.run().await.unwrap();
    h.b.fail_applies_forever();
    h.a.upsert_local(rec("a2", 100));
    h.engine.run().await.unwrap();
    h.b.heal();
    h.engine.run().await.unwrap();

    let runs = h.index.get_runs(JOB).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[1].status, RunStatus::Failed);
    assert_eq!(runs[2].status, RunStatus::Success);
    for run in &runs {
        assert!(run.ended_at >= run.started_at);
        assert!(run.stats().is_some());
    }
}

#[tokio::test]
async fn simultaneous_delete_does_not_loop() {
    let h = harness();
    h.a.upsert_local(rec("a1", 100));
    h.engine.run().await.unwrap();

    // Both sides drop the pair in the same window.
    h.a.delete_local("a1");
    h.b.delete_local("a1");

    let summary = h.engine.run().await.unwrap();
    assert_eq!(summary.status, RunStatus::Success);

    // One direction propagated, the echo guard swallowed the mirror.
    let s = stats(&summary);
    assert_eq!(s.deletes_a_to_b + s.deletes_b_to_a, 1);

    // Steady state immediately after.
    let next = h.engine.run().await.unwrap();
    assert_eq!(stats(&next).progress(), 0);
}
