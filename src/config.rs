//! Job configuration.
//!
//! The plain-data pieces (`ThrottleConfig`, `RetryConfig`, `ConflictPolicy`)
//! deserialize from whatever configuration surface the host exposes. The
//! runtime pieces ([`SideConfig`], [`SyncJob`]) carry live trait objects and
//! are assembled by the host after it has loaded adapters and mappers.
//!
//! # Example
//!
//! ```
//! use syncframe::{RetryConfig, ThrottleConfig};
//!
//! let throttle = ThrottleConfig::default();
//! assert_eq!(throttle.max_reqs, 50);
//! assert_eq!(throttle.batch_size, 10);
//!
//! let retry = RetryConfig::default();
//! assert_eq!(retry.max_attempts, 5);
//! assert_eq!(retry.disable_job_after, 20);
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::adapter::Adapter;
use crate::index::{LinkIndex, SideRef};
use crate::mapper::Mapper;

/// Per-side throttle and batching settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Max calls admitted within any sliding window.
    #[serde(default = "default_max_reqs")]
    pub max_reqs: u32,

    /// Window length in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Push batch size handed to `apply_changes`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_reqs() -> u32 {
    50
}
fn default_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    10
}

impl ThrottleConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_reqs: default_max_reqs(),
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

/// Push retry and failure-accounting settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per push batch before the cycle fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in seconds; doubles per attempt.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: f64,

    /// Consecutive failing cycles on one side before the job is disabled.
    #[serde(default = "default_disable_job_after")]
    pub disable_job_after: u32,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_secs() -> f64 {
    30.0
}
fn default_disable_job_after() -> u32 {
    20
}

impl RetryConfig {
    /// Backoff before retrying after failed attempt `attempt` (1-based):
    /// `backoff_secs * 2^(attempt - 1)`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64((self.backoff_secs * factor).max(0.0))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            disable_job_after: default_disable_job_after(),
        }
    }
}

/// What to do when both sides changed the same logical record in one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Compare `updatedAt`-class timestamps; newest wins, source on ties.
    #[default]
    LastWriterWins,
    /// Park the pair in the conflicts table for an operator.
    Manual,
}

/// One endpoint of a job: identity plus a live adapter.
#[derive(Clone)]
pub struct SideConfig {
    pub adapter_name: String,
    pub table: String,
    pub adapter: Arc<dyn Adapter>,
    pub throttle: ThrottleConfig,
}

impl SideConfig {
    pub fn new(
        adapter_name: impl Into<String>,
        table: impl Into<String>,
        adapter: Arc<dyn Adapter>,
    ) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            table: table.into(),
            adapter,
            throttle: ThrottleConfig::default(),
        }
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn side_ref(&self) -> SideRef {
        SideRef::new(self.adapter_name.clone(), self.table.clone())
    }
}

impl std::fmt::Debug for SideConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideConfig")
            .field("adapter_name", &self.adapter_name)
            .field("table", &self.table)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

/// Everything the engine needs to run one job.
#[derive(Clone)]
pub struct SyncJob {
    pub job_id: String,
    pub side_a: SideConfig,
    pub side_b: SideConfig,
    /// Mapper for the A -> B direction.
    pub mapper_a_to_b: Arc<dyn Mapper>,
    /// Mapper for the B -> A direction.
    pub mapper_b_to_a: Arc<dyn Mapper>,
    pub index: Arc<dyn LinkIndex>,
    pub retry: RetryConfig,
    pub conflict_policy: ConflictPolicy,
}

impl SyncJob {
    pub fn new(
        job_id: impl Into<String>,
        side_a: SideConfig,
        side_b: SideConfig,
        mapper_a_to_b: Arc<dyn Mapper>,
        mapper_b_to_a: Arc<dyn Mapper>,
        index: Arc<dyn LinkIndex>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            side_a,
            side_b,
            mapper_a_to_b,
            mapper_b_to_a,
            index,
            retry: RetryConfig::default(),
            conflict_policy: ConflictPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}
