// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-side sliding-window rate limiter.
//!
//! At most `max_reqs` admissions within any `interval` window. The window
//! is a FIFO of admission timestamps trimmed before each decision; when it
//! is full, [`Throttler::acquire`] sleeps until the oldest admission ages
//! out. Each side of a job gets its own throttler; there is no global
//! coordination.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::trace;

pub struct Throttler {
    max_reqs: usize,
    interval: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl Throttler {
    /// `max_reqs` is clamped to at least 1.
    #[must_use]
    pub fn new(max_reqs: usize, interval: Duration) -> Self {
        Self {
            max_reqs: max_reqs.max(1),
            interval,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until a slot is free, then record the admission.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.admissions.lock().await;
                while window
                    .front()
                    .is_some_and(|t| t.elapsed() >= self.interval)
                {
                    window.pop_front();
                }

                if window.len() < self.max_reqs {
                    window.push_back(Instant::now());
                    return;
                }

                match window.front() {
                    Some(oldest) => self.interval.saturating_sub(oldest.elapsed()),
                    None => Duration::ZERO,
                }
            };

            trace!(wait_ms = wait.as_millis() as u64, "throttle window full");
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Admissions currently inside the window.
    pub async fn in_flight(&self) -> usize {
        let mut window = self.admissions.lock().await;
        while window
            .front()
            .is_some_and(|t| t.elapsed() >= self.interval)
        {
            window.pop_front();
        }
        window.len()
    }
}
