// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fail-fast guard around the replication enqueue.
//!
//! The dispatcher sends one message per dual-written call. When the broker is
//! down each of those sends would otherwise wait out a connect timeout before
//! its error is logged and swallowed. The guard trips after a run of failed
//! sends and short-circuits the next ones until `recovery_timeout` has passed,
//! at which point a few probe sends decide whether it closes again.
//!
//! ```rust,no_run
//! # use dual_write_engine::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() {
//! let guard = CircuitBreaker::new("transport_send", CircuitConfig::default());
//!
//! match guard.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => {}
//!     Err(CircuitError::Rejected) => { /* broker presumed down, message dropped */ }
//!     Err(CircuitError::Inner(e)) => { /* send attempted and failed */ }
//! }
//! # }
//! ```

use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Short-circuited: the wrapped future was never polled.
    #[error("circuit open, call not attempted")]
    Rejected,

    #[error("guarded call failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected => None,
        }
    }
}

/// Trip and recovery parameters.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Closed-state window; half of these calls failing trips the guard.
    pub failure_threshold: u32,
    /// Probe calls admitted after the open period.
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    fn build(&self) -> AsyncRecloser {
        Recloser::custom()
            .error_rate(0.5)
            .closed_len(self.failure_threshold.max(1) as usize)
            .half_open_len(self.success_threshold.max(1) as usize)
            .open_wait(self.recovery_timeout)
            .build()
            .into()
    }
}

/// Point-in-time counters for a guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub passed: u64,
    pub failed: u64,
    pub rejected: u64,
    /// Last call was short-circuited and no call has passed since.
    pub open: bool,
}

impl CircuitStats {
    pub fn attempted(&self) -> u64 {
        self.passed + self.failed
    }
}

#[derive(Default)]
struct Tally {
    passed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    open: AtomicBool,
}

/// Named guard with per-outcome counters.
pub struct CircuitBreaker {
    name: String,
    recloser: AsyncRecloser,
    tally: Tally,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            recloser: config.build(),
            tally: Tally::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the future produced by `f` if the guard admits it.
    ///
    /// A rejected future is dropped unpolled, so no I/O happens.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = self.recloser.call(f()).await;
        match outcome {
            Ok(value) => {
                self.tally.passed.fetch_add(1, Ordering::Relaxed);
                if self.tally.open.swap(false, Ordering::Relaxed) {
                    info!(circuit = %self.name, "Circuit closed, calls passing again");
                }
                metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Inner(e)) => {
                self.tally.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Guarded call failed");
                Err(CircuitError::Inner(e))
            }
            Err(RecloserError::Rejected) => {
                self.tally.rejected.fetch_add(1, Ordering::Relaxed);
                if !self.tally.open.swap(true, Ordering::Relaxed) {
                    warn!(circuit = %self.name, "Circuit open, short-circuiting calls");
                }
                metrics::record_circuit_rejection(&self.name);
                Err(CircuitError::Rejected)
            }
        }
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            passed: self.tally.passed.load(Ordering::Relaxed),
            failed: self.tally.failed.load(Ordering::Relaxed),
            rejected: self.tally.rejected.load(Ordering::Relaxed),
            open: self.tally.open.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        let s = self.stats();
        s.attempted() + s.rejected
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.stats().passed
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.stats().failed
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.stats().rejected
    }

    /// Whether the most recent call was short-circuited.
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.tally.open.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn tight() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn healthy_sends_pass_and_are_counted() {
        let guard = CircuitBreaker::new("send", CircuitConfig::testing());

        for _ in 0..3 {
            let r: Result<u8, CircuitError<&str>> = guard.call(|| async { Ok(1) }).await;
            assert_eq!(r.unwrap(), 1);
        }

        let stats = guard.stats();
        assert_eq!(stats.passed, 3);
        assert_eq!(stats.attempted(), 3);
        assert!(!stats.open);
    }

    #[tokio::test]
    async fn failed_send_surfaces_inner_error() {
        let guard = CircuitBreaker::new("send", CircuitConfig::testing());

        let r: Result<(), CircuitError<&str>> = guard.call(|| async { Err("refused") }).await;

        assert_eq!(r.unwrap_err().inner(), Some(&"refused"));
        assert_eq!(guard.failures(), 1);
        assert_eq!(guard.rejections(), 0);
    }

    #[tokio::test]
    async fn dead_broker_stops_being_contacted() {
        let guard = CircuitBreaker::new("send", tight());
        let contacted = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let contacted = Arc::clone(&contacted);
            let _: Result<(), CircuitError<&str>> = guard
                .call(|| async move {
                    contacted.fetch_add(1, Ordering::SeqCst);
                    Err("refused")
                })
                .await;
        }

        let stats = guard.stats();
        assert!(stats.rejected > 0);
        assert_eq!(stats.failed as usize, contacted.load(Ordering::SeqCst));
        assert_eq!(guard.calls_total(), 10);
        assert!(guard.is_likely_open());
    }

    #[tokio::test]
    async fn probe_success_clears_open_flag() {
        let guard = CircuitBreaker::new("send", CircuitConfig::testing());

        for _ in 0..4 {
            let _: Result<(), CircuitError<&str>> = guard.call(|| async { Err("down") }).await;
        }
        assert!(guard.is_likely_open());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let r: Result<(), CircuitError<&str>> = guard.call(|| async { Ok(()) }).await;

        assert!(r.is_ok());
        assert!(!guard.is_likely_open());
    }

    #[test]
    fn rejected_has_no_inner() {
        let e: CircuitError<&str> = CircuitError::Rejected;
        assert!(e.is_rejected());
        assert!(e.inner().is_none());
        assert!(!CircuitError::Inner("x").is_rejected());
    }
}
