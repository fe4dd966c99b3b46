// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine: one pull -> transform -> push -> persist cycle per `run()`.
//!
//! # Cycle phases
//!
//! ```text
//! Idle -> CheckDisabled -> Pull -> Transform -> Push -> Persist -> Done
//!                   \________________________________________/
//!                                      v
//!                                    Failed
//! ```
//!
//! The two pulls run in parallel; pushes run sequentially per direction so
//! throttling and link installation stay easy to reason about. Every call
//! to [`SyncEngine::run`] appends exactly one run summary to the link
//! index, whatever happens.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use syncframe::{
//!     IdentityMapper, MemoryAdapter, MemoryLinkIndex, SideConfig, SyncEngine, SyncJob,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let job = SyncJob::new(
//!     "demo",
//!     SideConfig::new("airtable", "people", Arc::new(MemoryAdapter::new())),
//!     SideConfig::new("webflow", "members", Arc::new(MemoryAdapter::new())),
//!     Arc::new(IdentityMapper),
//!     Arc::new(IdentityMapper),
//!     Arc::new(MemoryLinkIndex::new()),
//! );
//!
//! let engine = SyncEngine::new(job);
//! let summary = engine.run().await.expect("link index reachable");
//! println!("cycle finished: {}", summary.status);
//! # }
//! ```

mod types;

pub use types::{CyclePhase, RunStats};

use std::collections::HashSet;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{Adapter, AdapterError};
use crate::config::{SideConfig, SyncJob};
use crate::index::{IndexError, RunStatus, RunSummary, SideRef};
use crate::metrics;
use crate::record::{now_millis, ChangeSet, Cursor};
use crate::throttle::Throttler;
use crate::transform::{plan_direction, DirectionPlan};

/// Which endpoint an error belongs to. The label text is load-bearing:
/// failure attribution matches "side A"/"side B" in rendered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideLabel {
    A,
    B,
}

impl std::fmt::Display for SideLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Abort cause of one cycle. Everything here lands in the run summary.
#[derive(Error, Debug)]
enum CycleError {
    #[error("side {side} pull failed: {source}")]
    Pull {
        side: SideLabel,
        source: AdapterError,
    },
    #[error("side {side} push failed after {attempts} attempts: {source}")]
    Push {
        side: SideLabel,
        attempts: u32,
        source: AdapterError,
    },
    #[error("link index failure: {0}")]
    Index(#[from] IndexError),
}

/// Which side(s) a cycle error is charged to.
///
/// Pragmatic v1 rule: substring-match the side label in the rendered
/// message; anything unattributable is charged to both sides.
fn attributed_sides(message: &str) -> (bool, bool) {
    let a = message.contains("side A") || message.contains("sideA");
    let b = message.contains("side B") || message.contains("sideB");
    if a || b {
        (a, b)
    } else {
        (true, true)
    }
}

/// Per-job synchronization engine.
///
/// One engine per job; one cycle at a time. The engine owns the two side
/// throttlers and drives everything else through the job's trait objects.
pub struct SyncEngine {
    job: SyncJob,
    throttle_a: Throttler,
    throttle_b: Throttler,
    phase: watch::Sender<CyclePhase>,
    phase_rx: watch::Receiver<CyclePhase>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(job: SyncJob) -> Self {
        let throttle_a = Throttler::new(
            job.side_a.throttle.max_reqs as usize,
            job.side_a.throttle.interval(),
        );
        let throttle_b = Throttler::new(
            job.side_b.throttle.max_reqs as usize,
            job.side_b.throttle.interval(),
        );
        let (phase, phase_rx) = watch::channel(CyclePhase::Idle);

        Self {
            job,
            throttle_a,
            throttle_b,
            phase,
            phase_rx,
        }
    }

    /// Current cycle phase.
    #[must_use]
    pub fn phase(&self) -> CyclePhase {
        *self.phase_rx.borrow()
    }

    /// Watch phase transitions.
    #[must_use]
    pub fn phase_receiver(&self) -> watch::Receiver<CyclePhase> {
        self.phase_rx.clone()
    }

    fn set_phase(&self, phase: CyclePhase) {
        let _ = self.phase.send(phase);
    }

    /// Run one cycle.
    ///
    /// Remote failures are absorbed into a `failed` [`RunSummary`]; the
    /// `Err` arm is reserved for the link index itself being unreachable,
    /// in which case there is nowhere to record the run.
    #[tracing::instrument(skip(self), fields(job_id = %self.job.job_id))]
    pub async fn run(&self) -> Result<RunSummary, IndexError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = now_millis();
        let clock = Instant::now();
        let index = self.job.index.as_ref();

        self.set_phase(CyclePhase::CheckDisabled);
        if index.is_job_disabled(&self.job.job_id).await? {
            warn!("job is disabled, refusing cycle");
            let stats = RunStats {
                reason: Some("job_disabled".into()),
                duration_ms: clock.elapsed().as_millis() as u64,
                ..Default::default()
            };
            let summary = self.build_summary(run_id, started_at, RunStatus::Failed, &stats);
            index.insert_run(&summary).await?;
            self.set_phase(CyclePhase::Failed);
            metrics::record_cycle(RunStatus::Failed);
            return Ok(summary);
        }

        let mut stats = RunStats::default();
        let outcome = self.cycle(&mut stats).await;
        stats.duration_ms = clock.elapsed().as_millis() as u64;

        let summary = match outcome {
            Ok((cursor_a, cursor_b)) => {
                self.set_phase(CyclePhase::Persist);
                let job_id = &self.job.job_id;
                let a = &self.job.side_a;
                let b = &self.job.side_b;

                index
                    .save_cursor(job_id, &a.adapter_name, &a.table, &cursor_a)
                    .await?;
                index
                    .save_cursor(job_id, &b.adapter_name, &b.table, &cursor_b)
                    .await?;
                index.reset_fail_count(job_id, &a.adapter_name, &a.table).await?;
                index.reset_fail_count(job_id, &b.adapter_name, &b.table).await?;

                let status = stats.status();
                let summary = self.build_summary(run_id, started_at, status, &stats);
                index.insert_run(&summary).await?;
                self.set_phase(CyclePhase::Done);
                info!(
                    status = %status,
                    pushed = stats.progress(),
                    retries = stats.retries,
                    conflicts = stats.conflicts,
                    duration_ms = stats.duration_ms,
                    "cycle finished"
                );
                summary
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "cycle aborted");
                stats.errors.push(message.clone());

                let (hit_a, hit_b) = attributed_sides(&message);
                let sides = [(hit_a, &self.job.side_a), (hit_b, &self.job.side_b)];
                for (hit, side) in sides {
                    if !hit {
                        continue;
                    }
                    let count = index
                        .increment_fail_count(&self.job.job_id, &side.adapter_name, &side.table)
                        .await?;
                    if count >= self.job.retry.disable_job_after {
                        warn!(
                            adapter = %side.adapter_name,
                            fail_count = count,
                            threshold = self.job.retry.disable_job_after,
                            "failure threshold reached, disabling job"
                        );
                        index.set_job_disabled(&self.job.job_id, now_millis()).await?;
                    }
                }

                let summary = self.build_summary(run_id, started_at, RunStatus::Failed, &stats);
                index.insert_run(&summary).await?;
                self.set_phase(CyclePhase::Failed);
                summary
            }
        };

        metrics::record_cycle(summary.status);
        metrics::record_cycle_duration(stats.duration_ms);
        Ok(summary)
    }

    /// The fallible middle of a cycle: pull, transform, push. Returns the
    /// advanced cursors for the persist step.
    async fn cycle(&self, stats: &mut RunStats) -> Result<(Cursor, Cursor), CycleError> {
        let job_id = &self.job.job_id;
        let index = self.job.index.as_ref();
        let a = &self.job.side_a;
        let b = &self.job.side_b;

        self.set_phase(CyclePhase::Pull);
        let cursor_a = index.load_cursor(job_id, &a.adapter_name, &a.table).await?;
        let cursor_b = index.load_cursor(job_id, &b.adapter_name, &b.table).await?;

        let (pull_a, pull_b) = tokio::join!(
            a.adapter.get_updates(&cursor_a),
            b.adapter.get_updates(&cursor_b),
        );
        let (changes_a, next_a) = pull_a.map_err(|source| CycleError::Pull {
            side: SideLabel::A,
            source,
        })?;
        let (changes_b, next_b) = pull_b.map_err(|source| CycleError::Pull {
            side: SideLabel::B,
            source,
        })?;
        debug!(
            a_changes = changes_a.len(),
            b_changes = changes_b.len(),
            "pulls complete"
        );

        self.set_phase(CyclePhase::Transform);
        let ref_a = a.side_ref();
        let ref_b = b.side_ref();
        let mut pushed_this_cycle = HashSet::new();

        let plan_ab = plan_direction(
            job_id,
            &ref_a,
            &ref_b,
            &changes_a,
            &changes_b,
            self.job.mapper_a_to_b.as_ref(),
            index,
            self.job.conflict_policy,
            &mut pushed_this_cycle,
        )
        .await?;
        let plan_ba = plan_direction(
            job_id,
            &ref_b,
            &ref_a,
            &changes_b,
            &changes_a,
            self.job.mapper_b_to_a.as_ref(),
            index,
            self.job.conflict_policy,
            &mut pushed_this_cycle,
        )
        .await?;

        for plan in [&plan_ab, &plan_ba] {
            stats.errors.extend(plan.errors.iter().cloned());
            stats.conflicts += plan.conflicts as u32;
        }

        self.set_phase(CyclePhase::Push);
        let (upserts, deletes) = self
            .push_direction(SideLabel::B, &ref_a, &ref_b, b, &self.throttle_b, plan_ab, stats)
            .await?;
        stats.upserts_a_to_b = upserts;
        stats.deletes_a_to_b = deletes;
        metrics::record_pushed("a_to_b", upserts, deletes);

        let (upserts, deletes) = self
            .push_direction(SideLabel::A, &ref_b, &ref_a, a, &self.throttle_a, plan_ba, stats)
            .await?;
        stats.upserts_b_to_a = upserts;
        stats.deletes_b_to_a = deletes;
        metrics::record_pushed("b_to_a", upserts, deletes);

        Ok((next_a, next_b))
    }

    /// Push one direction's plan in batches, then install its links.
    /// Links only exist once every batch of the direction landed.
    async fn push_direction(
        &self,
        dest_label: SideLabel,
        src_side: &SideRef,
        dest_side: &SideRef,
        dest: &SideConfig,
        throttle: &Throttler,
        plan: DirectionPlan,
        stats: &mut RunStats,
    ) -> Result<(usize, usize), CycleError> {
        if plan.changes.is_empty() {
            return Ok((0, 0));
        }

        let upserts = plan.changes.upserts.len();
        let deletes = plan.changes.deletes.len();

        for batch in plan.changes.into_batches(dest.throttle.batch_size) {
            self.apply_with_retry(dest_label, dest.adapter.as_ref(), throttle, &batch, stats)
                .await?;
        }

        for (src_id, dest_id) in &plan.links {
            self.job
                .index
                .upsert_link(&src_side.entity(src_id), &dest_side.entity(dest_id))
                .await?;
        }

        Ok((upserts, deletes))
    }

    /// Throttled push of one batch with exponential backoff:
    /// `backoff_secs * 2^(attempt - 1)` between attempts.
    async fn apply_with_retry(
        &self,
        side: SideLabel,
        adapter: &dyn Adapter,
        throttle: &Throttler,
        batch: &ChangeSet,
        stats: &mut RunStats,
    ) -> Result<(), CycleError> {
        let max_attempts = self.job.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            throttle.acquire().await;
            match adapter.apply_changes(batch).await {
                Ok(()) => return Ok(()),
                Err(source) if attempt < max_attempts => {
                    stats.retries += 1;
                    metrics::record_retry();
                    let delay = self.job.retry.backoff_for(attempt);
                    warn!(
                        side = %side,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %source,
                        "push attempt failed, backing off"
                    );
                    sleep(delay).await;
                }
                Err(source) => {
                    return Err(CycleError::Push {
                        side,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    fn build_summary(
        &self,
        run_id: String,
        started_at: i64,
        status: RunStatus,
        stats: &RunStats,
    ) -> RunSummary {
        RunSummary {
            run_id,
            job_id: self.job.job_id.clone(),
            started_at,
            ended_at: now_millis(),
            status,
            summary_json: serde_json::to_string(stats).unwrap_or_else(|_| "{}".into()),
        }
    }
}
