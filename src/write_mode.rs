// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Externally stored write mode.
//!
//! Read on every dispatched call, changed out-of-band by an operator. A read
//! never fails: a missing key, an unparseable value or a store error all
//! resolve to the configured default, with a log line saying which.

use crate::error::{DualWriteError, Result};
use crate::invoker::BoxFuture;
use crate::metrics;
use crate::types::WriteMode;
use redis::aio::ConnectionManager;
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Source of the current [`WriteMode`].
pub trait WriteModeStore: Send + Sync + 'static {
    /// Current mode, or the configured default if it cannot be determined.
    fn get(&self) -> BoxFuture<'_, WriteMode>;

    fn set(&self, mode: WriteMode) -> BoxFuture<'_, Result<()>>;
}

/// Resolve a raw stored value against `default`.
pub fn resolve_mode(raw: Option<&str>, default: WriteMode) -> WriteMode {
    match raw {
        None => {
            debug!(default = %default, "No write mode stored, using default");
            default
        }
        Some(value) => match value.parse::<WriteMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!(raw_mode = %value, error = %e, default = %default, "Stored write mode not recognized, using default");
                metrics::record_policy_anomaly("unknown_mode");
                default
            }
        },
    }
}

// =============================================================================
// Redis
// =============================================================================

/// Mode stored as a plain string under one key.
#[derive(Clone)]
pub struct RedisWriteModeStore {
    conn: ConnectionManager,
    key: String,
    default: WriteMode,
}

impl RedisWriteModeStore {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, default: WriteMode) -> Self {
        Self {
            conn,
            key: key.into(),
            default,
        }
    }
}

impl WriteModeStore for RedisWriteModeStore {
    fn get(&self) -> BoxFuture<'_, WriteMode> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: redis::RedisResult<Option<String>> =
                redis::cmd("GET").arg(&self.key).query_async(&mut conn).await;
            match raw {
                Ok(value) => resolve_mode(value.as_deref(), self.default),
                Err(e) => {
                    error!(key = %self.key, error = %e, default = %self.default, "Failed to read write mode, using default");
                    self.default
                }
            }
        })
    }

    fn set(&self, mode: WriteMode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("SET")
                .arg(&self.key)
                .arg(mode.as_str())
                .query_async(&mut conn)
                .await
                .map_err(|e| DualWriteError::redis("SET", e))?;
            metrics::set_write_mode(mode.as_str());
            info!(mode = %mode, key = %self.key, "Write mode changed");
            Ok(())
        })
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Process-local mode holder. Stores the raw value so unparseable input can be
/// injected and resolved the same way the Redis store resolves it.
#[derive(Debug)]
pub struct MemoryWriteModeStore {
    raw: RwLock<Option<String>>,
    default: WriteMode,
}

impl MemoryWriteModeStore {
    /// Empty store; reads return `default` until a mode is set.
    pub fn new(default: WriteMode) -> Self {
        Self {
            raw: RwLock::new(None),
            default,
        }
    }

    /// Store preloaded with `mode`.
    pub fn with_mode(mode: WriteMode) -> Self {
        Self {
            raw: RwLock::new(Some(mode.as_str().to_string())),
            default: WriteMode::default(),
        }
    }

    /// Overwrite the stored value verbatim, valid or not.
    pub fn set_raw(&self, value: impl Into<String>) {
        *self.raw.write().unwrap_or_else(|e| e.into_inner()) = Some(value.into());
    }

    pub fn clear(&self) {
        *self.raw.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Default for MemoryWriteModeStore {
    fn default() -> Self {
        Self::new(WriteMode::default())
    }
}

impl WriteModeStore for MemoryWriteModeStore {
    fn get(&self) -> BoxFuture<'_, WriteMode> {
        Box::pin(async move {
            let raw = self.raw.read().unwrap_or_else(|e| e.into_inner()).clone();
            resolve_mode(raw.as_deref(), self.default)
        })
    }

    fn set(&self, mode: WriteMode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.set_raw(mode.as_str());
            metrics::set_write_mode(mode.as_str());
            info!(mode = %mode, "Write mode changed");
            Ok(())
        })
    }
}
