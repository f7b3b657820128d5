// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication consumer: applies deferred second writes.
//!
//! # Per-message state machine
//!
//! ```text
//! Received ──exists?──► Duplicate (ack, stop)
//!    │ no
//!    ▼
//! Executing ── scope(target_store) invoke ──┬── ok ──► mark processed ──► Applied
//!                                           │
//!                                         error
//!                                           ▼
//!                          retry_count += 1, succeeded = false
//!                                           │
//!                 retry_count <= max ───────┼──────── otherwise
//!                          ▼                                 ▼
//!        send_delayed(delay_for(retry_count))           Abandoned
//!                  RetryScheduled                 (error log + dead-letter hook)
//! ```
//!
//! The processed marker is written only after the invocation succeeded. A crash
//! between the two means one more replay on redelivery; the operation itself
//! must tolerate that.

use crate::context;
use crate::dead_letter::{DeadLetterHook, LogDeadLetter};
use crate::idempotency::IdempotencyStore;
use crate::invoker::OperationInvoker;
use crate::message::ReplicationMessage;
use crate::metrics;
use crate::resilience::RetrySchedule;
use crate::transport::{Delivery, Transport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default lifetime of a processed marker.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Already applied earlier; nothing executed.
    Duplicate,
    /// Second write applied.
    Applied,
    /// Attempt failed; re-submitted with a delay.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Attempt failed and no retry is left (or it could not be scheduled).
    Abandoned,
}

impl ConsumeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumeOutcome::Duplicate => "duplicate",
            ConsumeOutcome::Applied => "applied",
            ConsumeOutcome::RetryScheduled { .. } => "retry_scheduled",
            ConsumeOutcome::Abandoned => "abandoned",
        }
    }
}

/// Applies replication messages to their target store.
pub struct ReplicationConsumer {
    invoker: Arc<dyn OperationInvoker>,
    idempotency: Arc<dyn IdempotencyStore>,
    transport: Arc<dyn Transport>,
    schedule: RetrySchedule,
    idempotency_ttl: Duration,
    dead_letter: Arc<dyn DeadLetterHook>,
}

impl ReplicationConsumer {
    pub fn new(
        invoker: Arc<dyn OperationInvoker>,
        idempotency: Arc<dyn IdempotencyStore>,
        transport: Arc<dyn Transport>,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            invoker,
            idempotency,
            transport,
            schedule,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            dead_letter: Arc::new(LogDeadLetter),
        }
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_dead_letter(mut self, hook: Arc<dyn DeadLetterHook>) -> Self {
        self.dead_letter = hook;
        self
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Process a delivery, then acknowledge it.
    ///
    /// Every outcome acknowledges: a retry travels as a new delayed message and
    /// an abandoned one has been handed to the dead-letter hook. An ack failure
    /// only means the delivery may come back, which the idempotency check absorbs
    /// for applied messages.
    pub async fn handle_delivery(&self, delivery: Delivery) -> ConsumeOutcome {
        let Delivery { message, receipt } = delivery;
        let outcome = self.process(message).await;

        if let Err(e) = self.transport.ack(&receipt).await {
            warn!(receipt = %receipt, error = %e, "Failed to acknowledge delivery");
            metrics::record_transport_error(self.transport.name(), "ack");
        }
        outcome
    }

    /// Run the state machine for one message.
    pub async fn process(&self, message: ReplicationMessage) -> ConsumeOutcome {
        let outcome = self.process_inner(message).await;
        metrics::record_consume(outcome.as_str());
        outcome
    }

    async fn process_inner(&self, mut message: ReplicationMessage) -> ConsumeOutcome {
        match self.idempotency.exists(&message.message_id).await {
            Ok(true) => {
                debug!(message_id = %message.message_id, "Already processed, skipping");
                return ConsumeOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Idempotency check failed");
                metrics::record_idempotency_error("exists");
                return self
                    .fail(message, format!("idempotency check failed: {e}"))
                    .await;
            }
        }

        let target = message.target_store;
        let start = Instant::now();
        let result = context::scope(target, async {
            self.invoker
                .invoke(target, &message.operation, &message.arg_types, &message.args)
                .await
        })
        .await;

        match result {
            Ok(_) => {
                metrics::record_replay_latency(target.as_str(), start.elapsed());
                message.mark_succeeded();
                if let Err(e) = self
                    .idempotency
                    .mark_processed(&message.message_id, self.idempotency_ttl)
                    .await
                {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Applied but could not mark processed; a redelivery will replay it"
                    );
                    metrics::record_idempotency_error("mark_processed");
                }
                debug!(
                    message_id = %message.message_id,
                    operation = %message.operation,
                    target = %target,
                    retry_count = message.retry_count,
                    "Replication applied"
                );
                ConsumeOutcome::Applied
            }
            Err(e) => self.fail(message, e.to_string()).await,
        }
    }

    /// Count a failed attempt and either schedule the next one or give up.
    async fn fail(&self, mut message: ReplicationMessage, reason: String) -> ConsumeOutcome {
        let attempt = message.mark_failed();

        if !self.schedule.should_retry(attempt) {
            return self.abandon(message, &reason).await;
        }

        let delay = self.schedule.delay_for(attempt);
        match self.transport.send_delayed(&message, delay).await {
            Ok(()) => {
                metrics::record_retry_scheduled(attempt, delay);
                warn!(
                    message_id = %message.message_id,
                    operation = %message.operation,
                    target = %message.target_store,
                    attempt,
                    max_retries = self.schedule.max_retries(),
                    delay = %humantime::format_duration(delay),
                    reason = %reason,
                    "Replication failed, retry scheduled"
                );
                ConsumeOutcome::RetryScheduled { attempt, delay }
            }
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    attempt,
                    error = %e,
                    "Could not schedule retry"
                );
                self.abandon(message, &format!("{reason}; retry enqueue failed: {e}"))
                    .await
            }
        }
    }

    async fn abandon(&self, message: ReplicationMessage, reason: &str) -> ConsumeOutcome {
        let payload = serde_json::to_string(&message).unwrap_or_else(|_| format!("{message:?}"));
        error!(
            message_id = %message.message_id,
            operation = %message.operation,
            target = %message.target_store,
            retry_count = message.retry_count,
            reason,
            message = %payload,
            "Replication abandoned"
        );
        metrics::record_abandoned(&message.operation.to_string());

        if let Err(e) = self.dead_letter.on_abandoned(&message, reason).await {
            error!(message_id = %message.message_id, error = %e, "Dead-letter hook failed");
        } else {
            info!(message_id = %message.message_id, "Dead letter recorded");
        }
        ConsumeOutcome::Abandoned
    }
}

impl std::fmt::Debug for ReplicationConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationConsumer")
            .field("transport", &self.transport.name())
            .field("schedule", &self.schedule)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .finish()
    }
}
