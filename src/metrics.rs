// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` facade for backend-agnostic collection; the host
//! picks the exporter. Naming: `syncframe_` prefix, `_total` counters,
//! `_seconds` duration histograms. Labels: `status` (success, partial,
//! failed), `direction` (a_to_b, b_to_a).

use metrics::{counter, histogram};

use crate::index::RunStatus;

/// Count one finished cycle by outcome.
pub fn record_cycle(status: RunStatus) {
    counter!(
        "syncframe_cycles_total",
        "status" => status.as_str()
    )
    .increment(1);
}

/// Record a cycle's wall-clock duration.
pub fn record_cycle_duration(duration_ms: u64) {
    histogram!("syncframe_cycle_seconds").record(duration_ms as f64 / 1000.0);
}

/// Count changes pushed for one direction of a cycle.
pub fn record_pushed(direction: &'static str, upserts: usize, deletes: usize) {
    if upserts > 0 {
        counter!(
            "syncframe_upserts_total",
            "direction" => direction
        )
        .increment(upserts as u64);
    }
    if deletes > 0 {
        counter!(
            "syncframe_deletes_total",
            "direction" => direction
        )
        .increment(deletes as u64);
    }
}

/// Count one retried push attempt.
pub fn record_retry() {
    counter!("syncframe_push_retries_total").increment(1);
}
