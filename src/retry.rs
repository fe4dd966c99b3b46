// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff helper for link-index I/O.
//!
//! This covers the store side only: connecting to the backing database and
//! individual queries. Push retries against remote adapters are budgeted
//! per job and live in the engine, where they feed the run's retry counter.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// How a failed store operation is re-attempted.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub attempts: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Connecting at startup: a handful of attempts, failing fast enough
    /// that a bad connection string is obvious.
    #[must_use]
    pub fn connect() -> Self {
        Self {
            attempts: 5,
            first_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Individual queries: brief retry, then hand the error to the caller.
    #[must_use]
    pub fn query() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

/// Run `operation` up to `policy.attempts` times, doubling the delay after
/// each failure.
pub async fn with_backoff<F, Fut, T, E>(
    name: &str,
    policy: &BackoffPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.first_delay;

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(
                    operation = name,
                    attempt,
                    attempts,
                    error = %err,
                    "store operation failed, backing off"
                );
                sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("loop returns on the final attempt")
}
