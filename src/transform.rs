// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transform & dedup: turn one side's pulled changes into a push-ready
//! changeset for the other side.
//!
//! Echo prevention is layered and both layers are load-bearing:
//!
//! 1. **Intra-cycle**: a `pushed_this_cycle` set shared by the two
//!    directions of one cycle, so a record produced by the A->B pass is
//!    not bounced straight back by the B->A pass.
//! 2. **Cross-cycle**: a reverse link lookup. If the destination record a
//!    source record maps to is already linked back to that same source
//!    record, the pull is just our own earlier write being reported back.
//!
//! Conflict handling sits in the middle of the upsert path: a true
//! conflict exists only when a linked record was upserted on *both* sides
//! in the same cycle.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConflictPolicy;
use crate::index::{Conflict, IndexError, LinkIndex, SideRef};
use crate::mapper::Mapper;
use crate::record::{now_millis, ChangeSet, Record};

/// Field names probed for a last-modified timestamp, in priority order.
/// The first *present* field decides; an unparseable value counts as
/// missing a timestamp entirely.
const TIMESTAMP_FIELDS: [&str; 8] = [
    "updatedAt",
    "updated_at",
    "updatedOn",
    "updated_on",
    "lastModified",
    "last_modified",
    "modifiedAt",
    "modified_at",
];

/// Output of one direction's transform pass.
#[derive(Debug, Default)]
pub struct DirectionPlan {
    /// Records to push to the destination side.
    pub changes: ChangeSet,
    /// `(src_id, dest_id)` pairs to install iff the push succeeds.
    pub links: Vec<(String, String)>,
    /// Per-record mapper failures; non-fatal.
    pub errors: Vec<String>,
    /// Conflicts parked under the `manual` policy this pass.
    pub conflicts: usize,
}

/// Map one direction's pulled changes into a push plan.
///
/// `source` is the changeset pulled from the direction's source side,
/// `opposite` the changeset pulled from its destination side (consulted
/// only for conflict detection). `pushed` is the cycle-wide echo set
/// shared between the two directions.
#[allow(clippy::too_many_arguments)]
pub async fn plan_direction(
    job_id: &str,
    src_side: &SideRef,
    dest_side: &SideRef,
    source: &ChangeSet,
    opposite: &ChangeSet,
    mapper: &dyn Mapper,
    index: &dyn LinkIndex,
    policy: ConflictPolicy,
    pushed: &mut HashSet<String>,
) -> Result<DirectionPlan, IndexError> {
    let mut plan = DirectionPlan::default();

    let opposite_upserts: HashMap<&str, &Record> = opposite
        .upserts
        .iter()
        .map(|r| (r.id.as_str(), r))
        .collect();

    for src_rec in &source.upserts {
        // Intra-cycle echo guard.
        if pushed.contains(&src_rec.id) {
            debug!(id = %src_rec.id, "skipping: already produced this cycle");
            continue;
        }

        let mapped = match mapper.to_dest(src_rec) {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!(id = %src_rec.id, error = %e, "mapper failed, skipping record");
                plan.errors
                    .push(format!("mapping record '{}' failed: {e}", src_rec.id));
                continue;
            }
        };

        // Cross-cycle echo guard: the destination record already points
        // back at this source record, so this change is our own write.
        if let Some(origin) = index.find_source(&dest_side.entity(&mapped.id)).await? {
            if origin == src_rec.id {
                debug!(id = %src_rec.id, "skipping: echo of our own write");
                continue;
            }
        }

        match index.find_dest(&src_side.entity(&src_rec.id)).await? {
            Some(dest_id) => {
                // Already linked. A true conflict needs the destination to
                // have upserted the counterpart in this same cycle.
                match opposite_upserts.get(dest_id.as_str()) {
                    Some(dest_rec) => match policy {
                        ConflictPolicy::LastWriterWins => {
                            if source_wins(src_rec, dest_rec) {
                                emit(&mut plan, pushed, mapped, &src_rec.id, dest_id);
                            } else {
                                debug!(
                                    id = %src_rec.id,
                                    "skipping: destination copy is newer"
                                );
                            }
                        }
                        ConflictPolicy::Manual => {
                            let conflict = Conflict {
                                conflict_id: Uuid::new_v4().to_string(),
                                job_id: job_id.to_string(),
                                src: src_side.entity(&src_rec.id),
                                dest: dest_side.entity(&dest_id),
                                src_payload: src_rec.fields.clone(),
                                dest_payload: dest_rec.fields.clone(),
                                detected_at: now_millis(),
                            };
                            index.insert_conflict(&conflict).await?;
                            plan.conflicts += 1;
                            // Freeze the whole pair for this cycle; the
                            // mirror direction must not push either half.
                            pushed.insert(dest_id);
                        }
                    },
                    None => {
                        // Only the source changed: an ordinary update.
                        emit(&mut plan, pushed, mapped, &src_rec.id, dest_id);
                    }
                }
            }
            None => {
                // New on the destination; link to the mapper-chosen id.
                let dest_id = mapped.id.clone();
                emit(&mut plan, pushed, mapped, &src_rec.id, dest_id);
            }
        }

        pushed.insert(src_rec.id.clone());
    }

    for src_id in &source.deletes {
        if pushed.contains(src_id) {
            continue;
        }
        match index.find_dest(&src_side.entity(src_id)).await? {
            Some(dest_id) => {
                pushed.insert(dest_id.clone());
                plan.changes.deletes.push(dest_id);
            }
            None => {
                // Never linked; nothing to propagate.
                debug!(id = %src_id, "skipping delete: no link");
            }
        }
    }

    Ok(plan)
}

fn emit(
    plan: &mut DirectionPlan,
    pushed: &mut HashSet<String>,
    mut mapped: Record,
    src_id: &str,
    dest_id: String,
) {
    mapped.id = dest_id.clone();
    pushed.insert(dest_id.clone());
    plan.links.push((src_id.to_string(), dest_id));
    plan.changes.upserts.push(mapped);
}

/// Last-writer-wins comparison: source propagates unless the destination
/// copy is strictly newer. A side with no extractable timestamp never
/// outranks the source.
fn source_wins(src: &Record, dest: &Record) -> bool {
    match (extract_timestamp(src), extract_timestamp(dest)) {
        (Some(src_ts), Some(dest_ts)) => src_ts >= dest_ts,
        _ => true,
    }
}

/// Probe the priority list for a last-modified timestamp.
pub(crate) fn extract_timestamp(record: &Record) -> Option<i64> {
    let fields = record.fields.as_object()?;
    let value = TIMESTAMP_FIELDS.iter().find_map(|key| fields.get(*key))?;
    parse_timestamp(value)
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => parse_datetime_str(s),
        _ => None,
    }
}

fn parse_datetime_str(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
    }
    // Epoch millis that arrived as a string.
    s.parse::<i64>().ok()
}
