// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process transport.
//!
//! Messages go through the wire codec like they would on Redis, so anything
//! that would not survive serialization fails here too. Unacknowledged
//! deliveries stay in flight until acked, reclaimed, or requeued.

use super::{Delivery, Receipt, Transport, TransportDepth};
use crate::codec::{self, EncodedMessage};
use crate::error::Result;
use crate::invoker::BoxFuture;
use crate::message::ReplicationMessage;
use crate::metrics;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, warn};

const NAME: &str = "memory";

/// One call to `send` or `send_delayed`, as seen by the transport.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub message: ReplicationMessage,
    /// `None` for immediate sends.
    pub delay: Option<Duration>,
}

#[derive(Default)]
struct Queues {
    ready: VecDeque<EncodedMessage>,
    delayed: Vec<(Instant, EncodedMessage)>,
    in_flight: HashMap<String, (EncodedMessage, Instant)>,
    /// Only kept by a recording transport.
    sent: Option<Vec<SentRecord>>,
    next_receipt: u64,
}

impl Queues {
    fn promote_due(&mut self, now: Instant) -> usize {
        let before = self.delayed.len();
        let mut still_waiting = Vec::with_capacity(before);
        for (due, encoded) in self.delayed.drain(..) {
            if due <= now {
                self.ready.push_back(encoded);
            } else {
                still_waiting.push((due, encoded));
            }
        }
        self.delayed = still_waiting;
        before - self.delayed.len()
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }

    fn deliver(&mut self, encoded: EncodedMessage, now: Instant) -> Option<Delivery> {
        match codec::decode(&encoded.payload, Some(&encoded.hash)) {
            Ok(message) => {
                self.next_receipt += 1;
                let receipt = Receipt(format!("mem-{}", self.next_receipt));
                self.in_flight.insert(receipt.0.clone(), (encoded, now));
                Some(Delivery { message, receipt })
            }
            Err(e) => {
                warn!(error = %e, "Dropping corrupt queued message");
                metrics::record_corrupt_entry(NAME);
                None
            }
        }
    }
}

/// Single-process queue with delayed delivery.
pub struct MemoryTransport {
    queues: Mutex<Queues>,
    notify: Notify,
    compress_threshold: usize,
}

impl MemoryTransport {
    pub fn new(compress_threshold: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            compress_threshold,
        }
    }

    /// A transport that also keeps a copy of every accepted message, for
    /// inspection through [`MemoryTransport::sent`]. The record is never
    /// trimmed, so this is for tests.
    pub fn recording() -> Self {
        let transport = Self::default();
        transport.lock().sent = Some(Vec::new());
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every message accepted so far, in order. Empty unless built with
    /// [`MemoryTransport::recording`].
    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone().unwrap_or_default()
    }

    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn delayed_count(&self) -> usize {
        self.lock().delayed.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Return every unacknowledged delivery to the ready queue, as a broker
    /// would after a consumer disconnects. Returns how many were requeued.
    pub fn requeue_unacked(&self) -> usize {
        let mut q = self.lock();
        let mut receipts: Vec<String> = q.in_flight.keys().cloned().collect();
        receipts.sort();
        let count = receipts.len();
        for receipt in receipts {
            if let Some((encoded, _)) = q.in_flight.remove(&receipt) {
                q.ready.push_back(encoded);
            }
        }
        drop(q);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    /// Enqueue raw wire bytes, bypassing the encoder.
    pub fn push_raw(&self, payload: Vec<u8>, hash: impl Into<String>) {
        self.lock().ready.push_back(EncodedMessage {
            payload,
            hash: hash.into(),
        });
        self.notify.notify_one();
    }

    fn accept(&self, message: &ReplicationMessage, delay: Option<Duration>) -> Result<()> {
        let encoded = codec::encode(message, self.compress_threshold)?;
        let mut q = self.lock();
        if let Some(sent) = q.sent.as_mut() {
            sent.push(SentRecord {
                message: message.clone(),
                delay,
            });
        }
        match delay {
            Some(d) if !d.is_zero() => q.delayed.push((Instant::now() + d, encoded)),
            _ => q.ready.push_back(encoded),
        }
        drop(q);
        self.notify.notify_one();
        trace!(message_id = %message.message_id, delay_ms = delay.map(|d| d.as_millis() as u64), "Queued in memory");
        Ok(())
    }

    fn take_ready(&self, max: usize) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut q = self.lock();
        let promoted = q.promote_due(now);
        if promoted > 0 {
            metrics::record_delayed_promoted(promoted);
        }
        let mut out = Vec::new();
        while out.len() < max {
            let Some(encoded) = q.ready.pop_front() else {
                break;
            };
            if let Some(delivery) = q.deliver(encoded, now) {
                out.push(delivery);
            }
        }
        (out, q.next_due())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn send<'a>(&'a self, message: &'a ReplicationMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.accept(message, None) })
    }

    fn send_delayed<'a>(
        &'a self,
        message: &'a ReplicationMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.accept(message, Some(delay)) })
    }

    fn receive(&self, max: usize, block: Duration) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move {
            let deadline = Instant::now() + block;
            loop {
                let (deliveries, next_due) = self.take_ready(max.max(1));
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
                let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
            }
        })
    }

    fn ack<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.lock().in_flight.remove(&receipt.0).is_none() {
                trace!(receipt = %receipt, "Ack for unknown receipt ignored");
            }
            Ok(())
        })
    }

    fn reclaim(&self, min_idle: Duration, max: usize) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut q = self.lock();
            let mut stale: Vec<String> = q
                .in_flight
                .iter()
                .filter(|(_, (_, since))| now.duration_since(*since) >= min_idle)
                .map(|(receipt, _)| receipt.clone())
                .collect();
            stale.sort();
            stale.truncate(max);

            let mut out = Vec::with_capacity(stale.len());
            for receipt in stale {
                if let Some((encoded, _)) = q.in_flight.remove(&receipt) {
                    if let Some(delivery) = q.deliver(encoded, now) {
                        out.push(delivery);
                    }
                }
            }
            if !out.is_empty() {
                metrics::record_reclaimed(out.len());
            }
            Ok(out)
        })
    }

    fn depth(&self) -> BoxFuture<'_, Result<TransportDepth>> {
        Box::pin(async move {
            let q = self.lock();
            Ok(TransportDepth {
                ready: q.ready.len(),
                delayed: q.delayed.len(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, OperationRef, StoreTarget, TypeDescriptor};
    use serde_json::json;

    fn msg(n: u64) -> ReplicationMessage {
        ReplicationMessage::new(
            OperationRef::new("orders", "insertOrder"),
            OperationKind::Create,
            vec![TypeDescriptor::new("Order")],
            vec![json!({ "id": n })],
            StoreTarget::Secondary,
        )
    }

    #[tokio::test]
    async fn test_send_receive_ack() {
        let t = MemoryTransport::default();
        let m = msg(1);
        t.send(&m).await.unwrap();

        let got = t.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message, m);
        assert_eq!(t.in_flight_count(), 1);

        t.ack(&got[0].receipt).await.unwrap();
        assert_eq!(t.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_receive_respects_max() {
        let t = MemoryTransport::default();
        for n in 0..5 {
            t.send(&msg(n)).await.unwrap();
        }
        let got = t.receive(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(t.ready_count(), 3);
    }

    #[tokio::test]
    async fn test_receive_empty_after_block() {
        let t = MemoryTransport::default();
        let got = t.receive(10, Duration::from_millis(20)).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let t = std::sync::Arc::new(MemoryTransport::default());
        let sender = std::sync::Arc::clone(&t);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send(&msg(1)).await.unwrap();
        });
        let got = t.receive(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_not_delivered_early() {
        let t = MemoryTransport::default();
        t.send_delayed(&msg(1), Duration::from_secs(5)).await.unwrap();
        assert_eq!(t.delayed_count(), 1);

        let early = t.receive(10, Duration::from_secs(1)).await.unwrap();
        assert!(early.is_empty());

        let later = t.receive(10, Duration::from_secs(10)).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(t.delayed_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_delay_is_immediate() {
        let t = MemoryTransport::recording();
        t.send_delayed(&msg(1), Duration::ZERO).await.unwrap();
        assert_eq!(t.ready_count(), 1);
        assert_eq!(t.sent()[0].delay, Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_requeue_unacked_redelivers_same_message() {
        let t = MemoryTransport::default();
        let m = msg(7);
        t.send(&m).await.unwrap();

        let first = t.receive(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(t.requeue_unacked(), 1);

        let second = t.receive(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second[0].message.message_id, first[0].message.message_id);
        assert_ne!(second[0].receipt, first[0].receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_idle_deliveries() {
        let t = MemoryTransport::default();
        t.send(&msg(1)).await.unwrap();
        let _held = t.receive(1, Duration::from_millis(10)).await.unwrap();

        assert!(t.reclaim(Duration::from_secs(30), 10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let reclaimed = t.reclaim(Duration::from_secs(30), 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(t.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_dropped() {
        let t = MemoryTransport::default();
        t.push_raw(b"{not json".to_vec(), "0000");
        t.send(&msg(2)).await.unwrap();

        let got = t.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(t.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_acked_traffic_leaves_nothing_behind() {
        let t = MemoryTransport::default();
        for n in 0..500 {
            t.send(&msg(n)).await.unwrap();
        }
        loop {
            let got = t.receive(64, Duration::from_millis(5)).await.unwrap();
            if got.is_empty() {
                break;
            }
            for delivery in &got {
                t.ack(&delivery.receipt).await.unwrap();
            }
        }

        assert_eq!(t.ready_count(), 0);
        assert_eq!(t.in_flight_count(), 0);
        assert_eq!(t.delayed_count(), 0);
        assert!(t.lock().sent.is_none());
        assert!(t.sent().is_empty());
    }

    #[tokio::test]
    async fn test_recording_keeps_history() {
        let t = MemoryTransport::recording();
        t.send(&msg(1)).await.unwrap();
        t.send_delayed(&msg(2), Duration::from_secs(1)).await.unwrap();

        let sent = t.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].delay, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_depth() {
        let t = MemoryTransport::default();
        t.send(&msg(1)).await.unwrap();
        t.send_delayed(&msg(2), Duration::from_secs(60)).await.unwrap();
        let depth = t.depth().await.unwrap();
        assert_eq!(depth, TransportDepth { ready: 1, delayed: 1 });
    }
}
