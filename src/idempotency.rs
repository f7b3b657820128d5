// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Processed-message markers.
//!
//! The consumer checks `exists(message_id)` before executing a delivery and
//! calls `mark_processed(message_id, ttl)` only after the invocation succeeded,
//! so a crash between the two replays the message rather than losing it.
//! Markers expire: a redelivery arriving after the TTL is executed again.
//!
//! An empty key is never considered processed and is never marked.

use crate::error::{DualWriteError, Result};
use crate::invoker::BoxFuture;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Durable-enough memory of which messages have been applied.
pub trait IdempotencyStore: Send + Sync + 'static {
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn mark_processed<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>>;
}

// =============================================================================
// Redis
// =============================================================================

/// Markers stored as `SET {prefix}{id} 1 EX {ttl}`.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if key.is_empty() {
                return Ok(false);
            }
            let mut conn = self.conn.clone();
            let found: i64 = redis::cmd("EXISTS")
                .arg(self.key(key))
                .query_async(&mut conn)
                .await
                .map_err(|e| DualWriteError::redis("EXISTS", e))?;
            Ok(found > 0)
        })
    }

    fn mark_processed<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if key.is_empty() {
                debug!("Skipping processed mark for empty message id");
                return Ok(());
            }
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("SET")
                .arg(self.key(key))
                .arg("1")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| DualWriteError::redis("SET", e))?;
            trace!(message_id = %key, ttl_secs = ttl.as_secs(), "Marked processed");
            Ok(())
        })
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Expired markers are swept on insert at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Marks {
    expires: HashMap<String, Instant>,
    next_sweep: Option<Instant>,
}

impl Marks {
    fn insert(&mut self, key: &str, expires_at: Instant, now: Instant) {
        if self.next_sweep.map_or(true, |at| now >= at) {
            let before = self.expires.len();
            self.expires.retain(|_, exp| *exp > now);
            let swept = before - self.expires.len();
            if swept > 0 {
                trace!(swept, "Swept expired markers");
            }
            self.next_sweep = Some(now + SWEEP_INTERVAL);
        }
        self.expires.insert(key.to_string(), expires_at);
    }
}

/// In-process markers with expiry, for single-process deployments and tests.
///
/// Markers that are never looked up again are still dropped once expired, so
/// the map stays bounded by the traffic of roughly one TTL.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    marks: Mutex<Marks>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Marks> {
        self.marks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live (unexpired) markers.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().expires.values().filter(|exp| **exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if key.is_empty() {
                return Ok(false);
            }
            let now = Instant::now();
            let mut marks = self.lock();
            match marks.expires.get(key) {
                Some(expires) if *expires > now => Ok(true),
                Some(_) => {
                    marks.expires.remove(key);
                    Ok(false)
                }
                None => Ok(false),
            }
        })
    }

    fn mark_processed<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if key.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            self.lock().insert(key, now + ttl, now);
            Ok(())
        })
    }
}
