// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dual-write engine coordinator.
//!
//! Ties together:
//! - the [`Dispatcher`] that callers route data-access calls through
//! - the write-mode store it consults on every call
//! - the transport carrying replication messages
//! - consumer workers applying them via [`ReplicationConsumer`]
//! - the dead-letter store for messages that ran out of retries
//!
//! # Architecture
//!
//! ```text
//!  caller ──► Dispatcher ──first write──► OperationInvoker (first store)
//!                 │
//!                 └──send──► Transport ──receive──► worker × N ──► ReplicationConsumer
//!                               ▲                                        │
//!                               └──────────── send_delayed ──────────────┘
//! ```
//!
//! The dispatcher works from construction onwards. `start()` only adds the
//! consumer side; a process that should write but never replay can skip it.

mod types;
mod worker;

pub use types::{EngineState, HealthCheck};

use crate::config::DualWriteConfig;
use crate::consumer::ReplicationConsumer;
use crate::dead_letter::{DeadLetterHook, LogDeadLetter, SqliteDeadLetterStore};
use crate::dispatch::Dispatcher;
use crate::error::{DualWriteError, Result};
use crate::idempotency::{IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore};
use crate::invoker::OperationInvoker;
use crate::metrics;
use crate::redis_conn;
use crate::resilience::{Bulkhead, ConnectBackoff, ReplayLimiter};
use crate::transport::{self, Transport};
use crate::types::WriteMode;
use crate::write_mode::{MemoryWriteModeStore, RedisWriteModeStore, WriteModeStore};
use futures::future::join_all;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use worker::WorkerContext;

/// How long `shutdown()` waits for the workers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The dual-write engine.
pub struct DualWriteEngine {
    config: DualWriteConfig,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    dispatcher: Arc<Dispatcher>,
    modes: Arc<dyn WriteModeStore>,
    transport: Arc<dyn Transport>,
    consumer: Arc<ReplicationConsumer>,
    bulkhead: Bulkhead,

    /// Shared connection for stores and health pings, when Redis is configured.
    redis: Option<ConnectionManager>,
    dead_letter_store: Option<Arc<SqliteDeadLetterStore>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker_handles: RwLock<Vec<JoinHandle<()>>>,
}

impl DualWriteEngine {
    /// Build an engine from configuration.
    ///
    /// With `redis_url` set, the write mode and idempotency markers live in
    /// Redis; otherwise both are process-local. The transport follows
    /// `mq.backend`. A `dead_letter.sqlite_path` enables dead-letter persistence.
    pub async fn new(config: DualWriteConfig, invoker: Arc<dyn OperationInvoker>) -> Result<Self> {
        config.validate()?;
        let retry = ConnectBackoff::startup();

        let redis = match &config.redis_url {
            Some(url) => Some(redis_conn::connect(url, &retry).await?),
            None => None,
        };

        let (modes, idempotency): (Arc<dyn WriteModeStore>, Arc<dyn IdempotencyStore>) =
            match &redis {
                Some(conn) => (
                    Arc::new(RedisWriteModeStore::new(
                        conn.clone(),
                        &config.write_mode.redis_key,
                        config.write_mode.default,
                    )),
                    Arc::new(RedisIdempotencyStore::new(
                        conn.clone(),
                        &config.idempotency.key_prefix,
                    )),
                ),
                None => (
                    Arc::new(MemoryWriteModeStore::new(config.write_mode.default)),
                    Arc::new(MemoryIdempotencyStore::new()),
                ),
            };

        let transport = transport::build_transport(&config, &retry).await?;

        let dead_letter_store = match &config.dead_letter.sqlite_path {
            Some(path) => Some(Arc::new(SqliteDeadLetterStore::new(path).await?)),
            None => None,
        };
        let hook: Arc<dyn DeadLetterHook> = match &dead_letter_store {
            Some(store) => store.clone(),
            None => Arc::new(LogDeadLetter),
        };

        let mut engine = Self::from_parts(config, invoker, modes, idempotency, transport, hook)?;
        engine.redis = redis;
        engine.dead_letter_store = dead_letter_store;
        Ok(engine)
    }

    /// Build an engine around caller-supplied stores and transport.
    pub fn from_parts(
        config: DualWriteConfig,
        invoker: Arc<dyn OperationInvoker>,
        modes: Arc<dyn WriteModeStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        transport: Arc<dyn Transport>,
        dead_letter: Arc<dyn DeadLetterHook>,
    ) -> Result<Self> {
        let schedule = config.retry.schedule()?;

        let dispatcher = Arc::new(Dispatcher::with_circuit(
            Arc::clone(&invoker),
            Arc::clone(&modes),
            Some(Arc::clone(&transport)),
            config.circuit.to_circuit_config(),
        ));

        let consumer = ReplicationConsumer::new(invoker, idempotency, Arc::clone(&transport), schedule)
            .with_idempotency_ttl(config.idempotency.ttl_duration())
            .with_dead_letter(dead_letter);

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_engine_state(EngineState::Created.as_str());

        Ok(Self {
            bulkhead: Bulkhead::new(config.mq.max_in_flight),
            config,
            state_tx,
            state_rx,
            dispatcher,
            modes,
            transport,
            consumer: Arc::new(consumer),
            redis: None,
            dead_letter_store: None,
            shutdown_tx,
            shutdown_rx,
            worker_handles: RwLock::new(Vec::new()),
        })
    }

    /// Entry point for data-access calls. Usable in every state.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn consumer(&self) -> &Arc<ReplicationConsumer> {
        &self.consumer
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn dead_letter_store(&self) -> Option<&Arc<SqliteDeadLetterStore>> {
        self.dead_letter_store.as_ref()
    }

    pub fn config(&self) -> &DualWriteConfig {
        &self.config
    }

    /// Operator switch: takes effect on the next dispatched call.
    pub async fn set_write_mode(&self, mode: WriteMode) -> Result<()> {
        self.modes.set(mode).await
    }

    pub async fn write_mode(&self) -> WriteMode {
        self.modes.get().await
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state.as_str());
    }

    /// Start the consumer workers.
    ///
    /// Probes the transport first; an unreachable transport leaves the engine
    /// `Failed`.
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(DualWriteError::InvalidState {
                expected: EngineState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        if let Err(e) = self.transport.depth().await {
            error!(transport = self.transport.name(), error = %e, "Transport unreachable");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let mq = &self.config.mq;
        let rate_limiter = mq.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.per_sec,
                burst = cfg.burst,
                "Rate limiting enabled for consumers"
            );
            Arc::new(ReplayLimiter::new(cfg))
        });

        let ctx = WorkerContext {
            consumer: Arc::clone(&self.consumer),
            bulkhead: self.bulkhead.clone(),
            rate_limiter,
            batch_size: mq.batch_size,
            block_timeout: mq.block_timeout_duration(),
            error_backoff: mq.error_backoff_duration(),
            reclaim_idle: mq.reclaim_idle_duration(),
        };

        let mut handles = self.worker_handles.write().await;
        for worker_id in 0..mq.workers {
            let handle = tokio::spawn(worker::run_worker(
                worker_id,
                ctx.clone(),
                self.shutdown_rx.clone(),
            ));
            handles.push(handle);
        }

        self.set_state(EngineState::Running);
        info!(
            workers = mq.workers,
            transport = self.transport.name(),
            max_in_flight = mq.max_in_flight,
            "Dual-write engine running"
        );
        Ok(())
    }

    /// Stop the workers, letting in-flight deliveries finish.
    pub async fn shutdown(&self) {
        info!("Shutting down dual-write engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.worker_handles.write().await;
            std::mem::take(&mut *guard)
        };

        let drained = join_all(
            handles
                .into_iter()
                .map(|handle| tokio::time::timeout(DRAIN_TIMEOUT, handle)),
        )
        .await;

        for (i, result) in drained.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => debug!(worker = i, "Worker completed gracefully"),
                Ok(Err(e)) => warn!(worker = i, error = %e, "Worker panicked during shutdown"),
                Err(_) => warn!(worker = i, "Worker timed out during shutdown"),
            }
        }
        // A worker that outlived the drain timeout must not start new replays.
        self.bulkhead.close();

        if let Some(store) = &self.dead_letter_store {
            store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Dual-write engine stopped");
    }

    /// Health snapshot. Queries the transport depth and pings Redis, if configured.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let write_mode = self.modes.get().await;
        let transport_depth = self.transport.depth().await.ok();

        let redis_latency = match &self.redis {
            Some(conn) => redis_conn::ping(conn).await.ok(),
            None => None,
        };

        let dead_letters = match &self.dead_letter_store {
            Some(store) => store.count().await.ok(),
            None => None,
        };

        let send_circuit_open = self.dispatcher.send_circuit().is_likely_open();
        let ready = state == EngineState::Running;
        let healthy = ready
            && transport_depth.is_some()
            && !send_circuit_open
            && (self.redis.is_none() || redis_latency.is_some());

        HealthCheck {
            state,
            ready,
            write_mode,
            transport: self.transport.name(),
            transport_depth,
            redis_latency,
            send_circuit_open,
            workers: self.worker_handles.read().await.len(),
            in_flight_available: self.bulkhead.available(),
            dead_letters,
            healthy,
        }
    }
}

impl std::fmt::Debug for DualWriteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualWriteEngine")
            .field("state", &self.state())
            .field("transport", &self.transport.name())
            .field("redis", &self.redis.is_some())
            .finish()
    }
}
