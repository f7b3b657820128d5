// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the dual-write engine.
//!
//! Constructed programmatically or deserialized from JSON. Durations are
//! humantime strings (`"500ms"`, `"24h"`). Call [`DualWriteConfig::validate`]
//! (done automatically by the `from_json_*` constructors and by
//! [`DualWriteEngine::new`](crate::DualWriteEngine::new)) before use.
//!
//! # Configuration Structure
//!
//! ```text
//! DualWriteConfig
//! ├── redis_url: Option<String>       # Shared by all Redis-backed components
//! ├── mq: MqConfig                    # Transport backend + consumer workers
//! ├── idempotency: IdempotencyConfig  # Processed-marker prefix and TTL
//! ├── write_mode: WriteModeConfig     # Mode key and default mode
//! ├── retry: RetryPolicyConfig        # Max retries + delay table
//! ├── dead_letter: DeadLetterConfig   # Optional SQLite dead-letter store
//! └── circuit: CircuitSettings        # Breaker on the enqueue path
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "redis_url": "redis://cache:6379",
//!   "mq": { "backend": "redis_stream", "consumer_group": "orders-dualwrite", "workers": 4 },
//!   "write_mode": { "default": "PRIMARY_ONLY" },
//!   "retry": { "max_retries": 3 },
//!   "dead_letter": { "sqlite_path": "/var/lib/app/dead_letters.db" }
//! }
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{DualWriteError, Result};
use crate::resilience::{ReplayRate, RetrySchedule, DEFAULT_MAX_RETRIES, STANDARD_DELAYS_SECS};
use crate::types::WriteMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| DualWriteError::Config(format!("{field}: invalid duration {value:?}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `DualWriteEngine::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DualWriteConfig {
    /// Redis URL used by the stream transport, the idempotency store and the
    /// write-mode store. `None` selects in-memory components.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub mq: MqConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    #[serde(default)]
    pub write_mode: WriteModeConfig,

    #[serde(default)]
    pub retry: RetryPolicyConfig,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub circuit: CircuitSettings,
}

impl DualWriteConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DualWriteError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// In-memory components and millisecond-scale timings.
    pub fn for_testing() -> Self {
        Self {
            redis_url: None,
            mq: MqConfig::for_testing(),
            idempotency: IdempotencyConfig::default(),
            write_mode: WriteModeConfig::default(),
            retry: RetryPolicyConfig::for_testing(),
            dead_letter: DeadLetterConfig::default(),
            circuit: CircuitSettings::for_testing(),
        }
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        self.retry.schedule()?;
        self.idempotency.ttl_duration_strict()?;
        // XREADGROUP BLOCK 0 waits forever.
        if parse_duration("mq.block_timeout", &self.mq.block_timeout)? < Duration::from_millis(1) {
            return Err(DualWriteError::Config(
                "mq.block_timeout must be at least 1ms".into(),
            ));
        }
        parse_duration("mq.reclaim_idle", &self.mq.reclaim_idle)?;
        parse_duration("mq.error_backoff", &self.mq.error_backoff)?;
        parse_duration("circuit.recovery_timeout", &self.circuit.recovery_timeout)?;

        if self.mq.workers == 0 {
            return Err(DualWriteError::Config("mq.workers must be at least 1".into()));
        }
        if self.mq.batch_size == 0 {
            return Err(DualWriteError::Config("mq.batch_size must be at least 1".into()));
        }
        if self.mq.max_in_flight == 0 {
            return Err(DualWriteError::Config("mq.max_in_flight must be at least 1".into()));
        }
        if self.mq.stream_key.is_empty() || self.mq.consumer_group.is_empty() {
            return Err(DualWriteError::Config(
                "mq.stream_key and mq.consumer_group must not be empty".into(),
            ));
        }
        if self.mq.stream_key == self.mq.delay_key {
            return Err(DualWriteError::Config(
                "mq.stream_key and mq.delay_key must differ".into(),
            ));
        }
        if self.mq.backend == MqBackend::RedisStream && self.redis_url.is_none() {
            return Err(DualWriteError::Config(
                "mq.backend = redis_stream requires redis_url".into(),
            ));
        }
        if self.idempotency.key_prefix.is_empty() {
            return Err(DualWriteError::Config(
                "idempotency.key_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MqConfig: transport selection and consumer workers
// ═══════════════════════════════════════════════════════════════════════════════

/// Which transport carries replication messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqBackend {
    /// Redis streams when `redis_url` is set, in-memory otherwise.
    #[default]
    Auto,
    #[serde(alias = "redis")]
    RedisStream,
    Memory,
}

/// Transport and consumer worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqConfig {
    #[serde(default)]
    pub backend: MqBackend,

    /// Stream carrying live replication messages.
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Sorted set holding delayed (retry) messages until they are due.
    #[serde(default = "default_delay_key")]
    pub delay_key: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name within the group. Generated per process when unset.
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// How long one receive call blocks waiting for messages (e.g. "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum deliveries per receive call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of consumer worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum replayed invocations running at once across all workers.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Deliveries unacknowledged for this long are reclaimed from their consumer.
    #[serde(default = "default_reclaim_idle")]
    pub reclaim_idle: String,

    /// Pause after a transport error before the next receive.
    #[serde(default = "default_error_backoff")]
    pub error_backoff: String,

    /// Payloads larger than this are zstd-compressed on the wire.
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold_bytes: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_stream_key() -> String {
    "dualwrite:replication".to_string()
}

fn default_delay_key() -> String {
    "dualwrite:replication:delayed".to_string()
}

fn default_consumer_group() -> String {
    "dualwrite-consumers".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_workers() -> usize {
    2
}

fn default_max_in_flight() -> usize {
    64
}

fn default_reclaim_idle() -> String {
    "60s".to_string()
}

fn default_error_backoff() -> String {
    "1s".to_string()
}

fn default_compress_threshold() -> usize {
    4096
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            backend: MqBackend::Auto,
            stream_key: default_stream_key(),
            delay_key: default_delay_key(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
            block_timeout: default_block_timeout(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_in_flight: default_max_in_flight(),
            reclaim_idle: default_reclaim_idle(),
            error_backoff: default_error_backoff(),
            compress_threshold_bytes: default_compress_threshold(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl MqConfig {
    pub fn for_testing() -> Self {
        Self {
            backend: MqBackend::Memory,
            block_timeout: "50ms".to_string(),
            workers: 1,
            reclaim_idle: "200ms".to_string(),
            error_backoff: "20ms".to_string(),
            ..Default::default()
        }
    }

    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn reclaim_idle_duration(&self) -> Duration {
        humantime::parse_duration(&self.reclaim_idle).unwrap_or(Duration::from_secs(60))
    }

    pub fn error_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.error_backoff).unwrap_or(Duration::from_secs(1))
    }

    /// Configured consumer name, or a fresh unique one.
    pub fn resolved_consumer_name(&self) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Rate limiter settings, or `None` when rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<ReplayRate> {
        if self.rate_limit_enabled {
            Some(ReplayRate {
                per_sec: self.rate_limit_per_sec,
                burst: self.rate_limit_burst,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Idempotency / write mode / retry / dead letters / circuit
// ═══════════════════════════════════════════════════════════════════════════════

/// Processed-message markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_idempotency_prefix")]
    pub key_prefix: String,

    /// How long a processed marker is kept (e.g. "24h").
    #[serde(default = "default_idempotency_ttl")]
    pub ttl: String,
}

fn default_idempotency_prefix() -> String {
    "dualwrite:idempotent:".to_string()
}

fn default_idempotency_ttl() -> String {
    "24h".to_string()
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_idempotency_prefix(),
            ttl: default_idempotency_ttl(),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.ttl).unwrap_or(Duration::from_secs(24 * 3600))
    }

    fn ttl_duration_strict(&self) -> Result<Duration> {
        let ttl = parse_duration("idempotency.ttl", &self.ttl)?;
        if ttl.as_secs() == 0 {
            return Err(DualWriteError::Config(
                "idempotency.ttl must be at least one second".into(),
            ));
        }
        Ok(ttl)
    }
}

/// Where the write mode lives and what to assume when it is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteModeConfig {
    #[serde(default = "default_write_mode_key")]
    pub redis_key: String,

    /// Mode used when the stored value is missing, unreadable or unparseable.
    #[serde(default)]
    pub default: WriteMode,
}

fn default_write_mode_key() -> String {
    "dualwrite:write-mode".to_string()
}

impl Default for WriteModeConfig {
    fn default() -> Self {
        Self {
            redis_key: default_write_mode_key(),
            default: WriteMode::PrimaryOnly,
        }
    }
}

/// Replication retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Re-deliveries allowed before a message is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay levels, 1-based by retry count; saturates at the last entry.
    #[serde(default = "default_retry_delays")]
    pub delays: Vec<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delays() -> Vec<String> {
    STANDARD_DELAYS_SECS
        .iter()
        .map(|s| humantime::format_duration(Duration::from_secs(*s)).to_string())
        .collect()
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delays: default_retry_delays(),
        }
    }
}

impl RetryPolicyConfig {
    pub fn for_testing() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delays: vec!["10ms".into(), "20ms".into(), "40ms".into()],
        }
    }

    /// Parse and validate the delay table.
    pub fn schedule(&self) -> Result<RetrySchedule> {
        let delays = self
            .delays
            .iter()
            .enumerate()
            .map(|(i, d)| parse_duration(&format!("retry.delays[{i}]"), d))
            .collect::<Result<Vec<_>>>()?;
        RetrySchedule::new(delays, self.max_retries)
    }
}

/// Durable store for abandoned messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// SQLite database path. `None` logs abandoned messages only.
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

/// Breaker on the dispatch path's replication enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_circuit_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_circuit_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_success_threshold() -> u32 {
    2
}

fn default_circuit_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_failure_threshold(),
            success_threshold: default_circuit_success_threshold(),
            recovery_timeout: default_circuit_recovery_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn for_testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: "50ms".to_string(),
        }
    }

    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: humantime::parse_duration(&self.recovery_timeout)
                .unwrap_or(Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
