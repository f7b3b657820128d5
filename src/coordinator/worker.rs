// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer worker loop.
//!
//! Each worker:
//! 1. Blocks on the transport for up to `block_timeout` (cancelled by shutdown)
//! 2. Spawns one task per delivery, each holding a bulkhead permit
//! 3. Periodically reclaims deliveries abandoned by crashed consumers
//! 4. Backs off exponentially while the transport keeps failing
//!
//! # Graceful Shutdown
//!
//! On the shutdown signal the worker stops receiving, then waits for every
//! delivery it already started. A delivery that never started stays pending on
//! the transport and is redelivered elsewhere.

use crate::consumer::ReplicationConsumer;
use crate::metrics;
use crate::resilience::{Bulkhead, ReplayLimiter};
use crate::transport::Delivery;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Everything a worker needs, shared across workers.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub consumer: Arc<ReplicationConsumer>,
    pub bulkhead: Bulkhead,
    pub rate_limiter: Option<Arc<ReplayLimiter>>,
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub error_backoff: Duration,
    pub reclaim_idle: Duration,
}

/// Run one consumer worker until shutdown is signaled.
pub(crate) async fn run_worker(
    worker_id: usize,
    ctx: WorkerContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("consumer_worker", worker = worker_id);

    async move {
        info!("Starting consumer worker");

        let transport = Arc::clone(ctx.consumer.transport());
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors = 0u32;
        let mut current_backoff = ctx.error_backoff;
        let mut last_reclaim = Instant::now();

        loop {
            while in_flight.try_join_next().is_some() {}

            if *shutdown_rx.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received during receive");
                        break;
                    }
                    continue;
                }

                result = transport.receive(ctx.batch_size, ctx.block_timeout) => result,
            };

            match received {
                Ok(deliveries) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Transport recovered");
                    }
                    consecutive_errors = 0;
                    current_backoff = ctx.error_backoff;

                    if !deliveries.is_empty() {
                        metrics::record_received(transport.name(), deliveries.len());
                        debug!(count = deliveries.len(), "Received deliveries");
                    }
                    if !dispatch_all(&ctx, &mut in_flight, deliveries).await {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    metrics::record_transport_error(transport.name(), "receive");
                    warn!(
                        error = %e,
                        retryable = e.is_retryable(),
                        consecutive_errors,
                        backoff_ms = current_backoff.as_millis() as u64,
                        "Receive failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(current_backoff) => {}
                    }
                    current_backoff = (current_backoff * 2).min(MAX_ERROR_BACKOFF);
                    continue;
                }
            }

            if last_reclaim.elapsed() >= ctx.reclaim_idle {
                last_reclaim = Instant::now();
                match transport.reclaim(ctx.reclaim_idle, ctx.batch_size).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(count = reclaimed.len(), "Reclaimed idle deliveries");
                        if !dispatch_all(&ctx, &mut in_flight, reclaimed).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        metrics::record_transport_error(transport.name(), "reclaim");
                        warn!(error = %e, "Reclaim failed");
                    }
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            info!(draining, "Waiting for in-flight deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Delivery task panicked");
            }
        }

        info!("Consumer worker stopped");
    }
    .instrument(span)
    .await;
}

/// Start one task per delivery. Returns `false` if the bulkhead was closed.
async fn dispatch_all(
    ctx: &WorkerContext,
    in_flight: &mut JoinSet<()>,
    deliveries: Vec<Delivery>,
) -> bool {
    for delivery in deliveries {
        if let Some(limiter) = &ctx.rate_limiter {
            limiter.wait().await;
        }

        let Some(permit) = ctx.bulkhead.acquire().await else {
            warn!("Bulkhead closed, leaving delivery pending");
            return false;
        };

        let consumer = Arc::clone(&ctx.consumer);
        in_flight.spawn(
            async move {
                let _permit = permit;
                consumer.handle_delivery(delivery).await;
            }
            .in_current_span(),
        );
    }
    true
}
