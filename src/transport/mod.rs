// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message transport between the dispatcher and consumer workers.
//!
//! One trait, selected once at startup from [`MqBackend`]:
//!
//! - [`MemoryTransport`]: in-process queues, for single-process deployments and tests
//! - [`RedisStreamTransport`]: Redis stream + consumer group, delayed retries in a sorted set
//!
//! Delivery is at-least-once. A delivery stays pending until acknowledged; a
//! consumer that dies holding one leaves it to be reclaimed by another.

mod memory;
mod redis_stream;

pub use memory::{MemoryTransport, SentRecord};
pub use redis_stream::RedisStreamTransport;

use crate::config::{DualWriteConfig, MqBackend};
use crate::error::{DualWriteError, Result};
use crate::invoker::BoxFuture;
use crate::message::ReplicationMessage;
use crate::redis_conn;
use crate::resilience::ConnectBackoff;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Opaque handle used to acknowledge one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub String);

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer, pending until acked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: ReplicationMessage,
    pub receipt: Receipt,
}

/// Queue depth snapshot for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportDepth {
    /// Messages ready for delivery.
    pub ready: usize,
    /// Retries waiting for their delay to elapse.
    pub delayed: usize,
}

/// Carries replication messages to consumer workers.
pub trait Transport: Send + Sync + 'static {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Enqueue for immediate delivery.
    fn send<'a>(&'a self, message: &'a ReplicationMessage) -> BoxFuture<'a, Result<()>>;

    /// Enqueue for delivery no earlier than `delay` from now.
    fn send_delayed<'a>(
        &'a self,
        message: &'a ReplicationMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    /// Wait up to `block` for at most `max` deliveries. An empty result is not an error.
    fn receive(&self, max: usize, block: Duration) -> BoxFuture<'_, Result<Vec<Delivery>>>;

    /// Acknowledge a delivery so it is never redelivered.
    fn ack<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<()>>;

    /// Take over deliveries left unacknowledged for at least `min_idle`.
    fn reclaim(&self, _min_idle: Duration, _max: usize) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn depth(&self) -> BoxFuture<'_, Result<TransportDepth>> {
        Box::pin(async { Ok(TransportDepth::default()) })
    }
}

/// Backend that `config.mq.backend` resolves to (`Auto` is never returned).
pub fn resolve_backend(config: &DualWriteConfig) -> MqBackend {
    match config.mq.backend {
        MqBackend::Auto if config.redis_url.is_some() => MqBackend::RedisStream,
        MqBackend::Auto => MqBackend::Memory,
        other => other,
    }
}

/// Build the configured transport, connecting to Redis if it resolves to streams.
pub async fn build_transport(
    config: &DualWriteConfig,
    retry: &ConnectBackoff,
) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match resolve_backend(config) {
        MqBackend::RedisStream => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                DualWriteError::Config("redis_stream transport requires redis_url".into())
            })?;
            let writer = redis_conn::connect(url, retry).await?;
            let reader = redis_conn::connect(url, retry).await?;
            Arc::new(RedisStreamTransport::new(writer, reader, &config.mq).await?)
        }
        _ => Arc::new(MemoryTransport::new(config.mq.compress_threshold_bytes)),
    };
    info!(transport = transport.name(), "Replication transport ready");
    Ok(transport)
}
