// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis streams transport.
//!
//! # Layout
//!
//! ```text
//! {stream_key}          XADD * payload <bytes> hash <sha256>
//!                       consumed by XREADGROUP in {consumer_group}
//! {delay_key}  (zset)   member = "<sha256>:<payload>", score = due time (ms)
//! ```
//!
//! Due members are moved from the sorted set to the stream by a Lua script, so
//! the ZREM and the XADD happen atomically and exactly one consumer promotes
//! each retry. Deliveries idle longer than `reclaim_idle` are taken over with
//! XAUTOCLAIM.
//!
//! Blocking reads use their own connection so an XREADGROUP in progress never
//! queues the dispatcher's XADDs behind it.

use super::{Delivery, Receipt, Transport, TransportDepth};
use crate::codec::{self, EncodedMessage, FIELD_HASH, FIELD_PAYLOAD};
use crate::config::MqConfig;
use crate::error::{DualWriteError, Result};
use crate::invoker::BoxFuture;
use crate::message::ReplicationMessage;
use crate::metrics;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

const NAME: &str = "redis_stream";

/// Hex SHA-256 length; the delayed-member separator sits right after it.
const HASH_LEN: usize = 64;

/// Move due members from the delay set to the stream.
/// KEYS[1] = delay set, KEYS[2] = stream; ARGV[1] = now (ms), ARGV[2] = limit.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  redis.call('XADD', KEYS[2], '*', 'payload', string.sub(member, 66), 'hash', string.sub(member, 1, 64))
end
return #due
";

/// Consumer-group transport over one Redis stream.
pub struct RedisStreamTransport {
    writer: ConnectionManager,
    reader: Mutex<ConnectionManager>,
    stream_key: String,
    delay_key: String,
    group: String,
    consumer: String,
    compress_threshold: usize,
    promote: Script,
}

impl RedisStreamTransport {
    /// Create the transport and its consumer group (with the stream, if missing).
    ///
    /// `writer` serves every non-blocking command; `reader` is reserved for
    /// XREADGROUP and must be a separate connection.
    pub async fn new(
        writer: ConnectionManager,
        reader: ConnectionManager,
        config: &MqConfig,
    ) -> Result<Self> {
        let transport = Self {
            writer,
            reader: Mutex::new(reader),
            stream_key: config.stream_key.clone(),
            delay_key: config.delay_key.clone(),
            group: config.consumer_group.clone(),
            consumer: config.resolved_consumer_name(),
            compress_threshold: config.compress_threshold_bytes,
            promote: Script::new(PROMOTE_SCRIPT),
        };
        transport.ensure_group().await?;
        Ok(transport)
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.writer.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(stream = %self.stream_key, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream_key, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(DualWriteError::redis("XGROUP CREATE", e)),
        }
    }

    async fn xadd(&self, encoded: &EncodedMessage) -> Result<String> {
        let mut conn = self.writer.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(FIELD_PAYLOAD)
            .arg(encoded.payload.as_slice())
            .arg(FIELD_HASH)
            .arg(&encoded.hash)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                metrics::record_transport_error(NAME, "XADD");
                DualWriteError::redis("XADD", e)
            })?;
        Ok(id)
    }

    /// Move due retries onto the stream. Returns how many were moved.
    async fn promote_due(&self, limit: usize) -> Result<usize> {
        let mut conn = self.writer.clone();
        let moved: usize = self
            .promote
            .key(&self.delay_key)
            .key(&self.stream_key)
            .arg(now_ms())
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                metrics::record_transport_error(NAME, "PROMOTE");
                DualWriteError::redis("EVALSHA promote", e)
            })?;
        if moved > 0 {
            metrics::record_delayed_promoted(moved);
            debug!(count = moved, "Promoted delayed messages");
        }
        Ok(moved)
    }

    async fn xack(&self, ids: &[&str]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.writer.clone();
        let _: i64 = conn
            .xack(&self.stream_key, &self.group, ids)
            .await
            .map_err(|e| {
                metrics::record_transport_error(NAME, "XACK");
                DualWriteError::redis("XACK", e)
            })?;
        Ok(())
    }

    /// Decode entries; corrupt ones are acknowledged away and skipped.
    async fn to_deliveries(
        &self,
        entries: Vec<(String, HashMap<String, Value>)>,
    ) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        let mut corrupt = Vec::new();

        for (id, fields) in entries {
            match codec::decode_fields(&fields) {
                Ok(message) => {
                    trace!(stream_id = %id, message_id = %message.message_id, "Received");
                    deliveries.push(Delivery {
                        message,
                        receipt: Receipt(id),
                    });
                }
                Err(e) => {
                    warn!(stream_id = %id, error = %e, "Dropping corrupt stream entry");
                    metrics::record_corrupt_entry(NAME);
                    corrupt.push(id);
                }
            }
        }

        let corrupt_refs: Vec<&str> = corrupt.iter().map(String::as_str).collect();
        self.xack(&corrupt_refs).await?;
        Ok(deliveries)
    }
}

impl Transport for RedisStreamTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn send<'a>(&'a self, message: &'a ReplicationMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let encoded = codec::encode(message, self.compress_threshold)?;
            let id = self.xadd(&encoded).await?;
            trace!(message_id = %message.message_id, stream_id = %id, "Sent");
            Ok(())
        })
    }

    fn send_delayed<'a>(
        &'a self,
        message: &'a ReplicationMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if delay.is_zero() {
                return self.send(message).await;
            }
            let encoded = codec::encode(message, self.compress_threshold)?;
            let member = delayed_member(&encoded);
            let due = now_ms().saturating_add(delay.as_millis() as u64);

            let mut conn = self.writer.clone();
            let _: i64 = conn.zadd(&self.delay_key, member, due).await.map_err(|e| {
                metrics::record_transport_error(NAME, "ZADD");
                DualWriteError::redis("ZADD", e)
            })?;
            trace!(message_id = %message.message_id, due_ms = due, "Scheduled delayed");
            Ok(())
        })
    }

    fn receive(&self, max: usize, block: Duration) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move {
            self.promote_due(max.max(1)).await?;

            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(max.max(1))
                .block(block.as_millis().max(1) as usize);

            let reply: StreamReadReply = {
                let mut reader = self.reader.lock().await;
                reader
                    .xread_options(&[&self.stream_key], &[">"], &opts)
                    .await
                    .map_err(|e| {
                        metrics::record_transport_error(NAME, "XREADGROUP");
                        DualWriteError::redis("XREADGROUP", e)
                    })?
            };

            let entries = reply
                .keys
                .into_iter()
                .flat_map(|key| key.ids)
                .map(|entry| (entry.id, entry.map))
                .collect();
            self.to_deliveries(entries).await
        })
    }

    fn ack<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.xack(&[receipt.0.as_str()]).await })
    }

    fn reclaim(&self, min_idle: Duration, max: usize) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move {
            let mut conn = self.writer.clone();
            let reply: Value = redis::cmd("XAUTOCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(min_idle.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(max.max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    metrics::record_transport_error(NAME, "XAUTOCLAIM");
                    DualWriteError::redis("XAUTOCLAIM", e)
                })?;

            let entries = parse_autoclaim(reply)?;
            if !entries.is_empty() {
                metrics::record_reclaimed(entries.len());
                info!(count = entries.len(), consumer = %self.consumer, "Reclaimed idle deliveries");
            }
            self.to_deliveries(entries).await
        })
    }

    fn depth(&self) -> BoxFuture<'_, Result<TransportDepth>> {
        Box::pin(async move {
            let mut conn = self.writer.clone();
            let ready: usize = conn
                .xlen(&self.stream_key)
                .await
                .map_err(|e| DualWriteError::redis("XLEN", e))?;
            let delayed: usize = conn
                .zcard(&self.delay_key)
                .await
                .map_err(|e| DualWriteError::redis("ZCARD", e))?;
            Ok(TransportDepth { ready, delayed })
        })
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// `"<hash>:<payload>"`, split again by the promote script.
fn delayed_member(encoded: &EncodedMessage) -> Vec<u8> {
    let mut member = Vec::with_capacity(HASH_LEN + 1 + encoded.payload.len());
    member.extend_from_slice(encoded.hash.as_bytes());
    member.push(b':');
    member.extend_from_slice(&encoded.payload);
    member
}

/// Parse an XAUTOCLAIM reply: `[cursor, [[id, [field, value, ...]] | nil, ...], (deleted)]`.
fn parse_autoclaim(reply: Value) -> Result<Vec<(String, HashMap<String, Value>)>> {
    let malformed = || DualWriteError::Codec("malformed XAUTOCLAIM reply".to_string());

    let Value::Array(parts) = reply else {
        return Err(malformed());
    };
    let Some(Value::Array(claimed)) = parts.into_iter().nth(1) else {
        return Err(malformed());
    };

    let mut entries = Vec::with_capacity(claimed.len());
    for entry in claimed {
        // Entries deleted from the stream while pending come back as nil.
        let Value::Array(pair) = entry else {
            continue;
        };
        let mut pair = pair.into_iter();
        let (Some(id), Some(Value::Array(flat))) = (pair.next(), pair.next()) else {
            continue;
        };
        let id = value_to_string(&id).ok_or_else(malformed)?;

        let mut fields = HashMap::new();
        let mut flat = flat.into_iter();
        while let (Some(k), Some(v)) = (flat.next(), flat.next()) {
            if let Some(k) = value_to_string(&k) {
                fields.insert(k, v);
            }
        }
        entries.push((id, fields));
    }
    Ok(entries)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
