// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry, pacing and concurrency limits for replication.
//!
//! [`RetrySchedule`] decides when a failed replication is re-delivered and
//! when it is given up on. [`ConnectBackoff`] covers the initial Redis
//! connect. [`ReplayLimiter`] and [`Bulkhead`] bound how hard the consumer
//! pushes on the second store.

use crate::error::{DualWriteError, Result};
use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, state::NotKeyed, Quota,
    RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of re-deliveries before a failed replication is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The standard delay levels, in order.
///
/// ```text
/// Level  Delay      Level  Delay
/// -----  -----      -----  -----
/// 1      1s         10     6m
/// 2      5s         11     7m
/// 3      10s        12     8m
/// 4      30s        13     9m
/// 5      1m         14     10m
/// 6      2m         15     20m
/// 7      3m         16     30m
/// 8      4m         17     1h
/// 9      5m         18     2h
/// ```
pub const STANDARD_DELAYS_SECS: [u64; 18] = [
    1, 5, 10, 30, 60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 1200, 1800, 3600, 7200,
];

/// Table-driven delay schedule for re-delivering failed replications.
///
/// `delay_for(n)` is the wait before attempt `n + 1`, where `n` is the number of
/// failures so far. Levels past the end of the table saturate at the last entry,
/// so the ceiling is always finite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
    max_retries: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetrySchedule {
    /// Build a schedule, rejecting an empty or decreasing table.
    pub fn new(delays: Vec<Duration>, max_retries: u32) -> Result<Self> {
        if delays.is_empty() {
            return Err(DualWriteError::Config(
                "retry delay table must not be empty".to_string(),
            ));
        }
        if let Some(pos) = delays.windows(2).position(|w| w[1] < w[0]) {
            return Err(DualWriteError::Config(format!(
                "retry delay table must be non-decreasing: level {} ({:?}) < level {} ({:?})",
                pos + 2,
                delays[pos + 1],
                pos + 1,
                delays[pos]
            )));
        }
        Ok(Self {
            delays,
            max_retries,
        })
    }

    /// The 18-level table with [`DEFAULT_MAX_RETRIES`].
    pub fn standard() -> Self {
        Self {
            delays: STANDARD_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Millisecond-scale schedule for tests.
    pub fn testing() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ],
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay for a message that has failed `retry_count` times.
    ///
    /// Level 0 means no delay.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let idx = (retry_count as usize).min(self.delays.len()) - 1;
        self.delays[idx]
    }

    /// Whether a message that has failed `retry_count` times gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Longest delay the schedule can produce.
    pub fn ceiling(&self) -> Duration {
        self.delays.last().copied().unwrap_or(Duration::ZERO)
    }
}

/// Backoff for the initial Redis connect.
///
/// Only startup needs it: a built `ConnectionManager` reconnects on its own.
#[derive(Debug, Clone)]
pub struct ConnectBackoff {
    pub attempts: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Bound on a single connect attempt.
    pub attempt_timeout: Duration,
}

impl ConnectBackoff {
    /// About 45s of attempts, so a wrong `redis_url` fails startup rather than hanging it.
    pub fn startup() -> Self {
        Self {
            attempts: 20,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 1.5,
            attempt_timeout: Duration::from_secs(10),
        }
    }

    pub fn testing() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            factor: 2.0,
            attempt_timeout: Duration::from_millis(500),
        }
    }

    /// Sleeps between consecutive attempts; one fewer than `attempts`.
    pub fn pauses(&self) -> impl Iterator<Item = Duration> + '_ {
        let cap = self.max_delay;
        std::iter::successors(Some(self.first_delay.min(cap)), move |prev| {
            let next = prev.as_secs_f64() * self.factor.max(1.0);
            Some(Duration::from_secs_f64(next.min(cap.as_secs_f64())))
        })
        .take(self.attempts.saturating_sub(1))
    }
}

/// Sustained and burst replay rate for the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRate {
    pub per_sec: u32,
    pub burst: u32,
}

type DirectLimiter = GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Paces deliveries handed to replay, shared by every worker.
pub struct ReplayLimiter {
    rate: ReplayRate,
    bucket: DirectLimiter,
}

impl ReplayLimiter {
    pub fn new(rate: ReplayRate) -> Self {
        let per_sec = NonZeroU32::new(rate.per_sec).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(rate.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            rate,
            bucket: GovLimiter::direct(Quota::per_second(per_sec).allow_burst(burst)),
        }
    }

    pub async fn wait(&self) {
        self.bucket.until_ready().await;
    }

    pub fn rate(&self) -> ReplayRate {
        self.rate
    }
}

impl std::fmt::Debug for ReplayLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ReplayLimiter").field(&self.rate).finish()
    }
}

/// Cap on replayed invocations running at once across all workers.
///
/// Clones share the same slots.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Wait for a slot; `None` once the bulkhead has been closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }

    /// Stop handing out slots; pending and future `acquire`s return `None`.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}
