// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch coordinator: the synchronous half of a dual write.
//!
//! # Flow
//!
//! ```text
//! DataCall ─► classify ─► read mode ─► route
//!                                        │
//!              ┌─────────────────────────┴───────────────┐
//!          single store                              dual write
//!              │                                         │
//!        scope(first) invoke                      scope(first) invoke
//!              │                                         │
//!        result / error ◄──────── error ─────────────────┤
//!                                                        │ ok
//!                                         ReplicationMessage → Transport::send
//!                                         (failure logged, never surfaced)
//!                                                        │
//!                                                 first write's result
//! ```
//!
//! The caller always observes exactly what the first write produced. Enqueue
//! problems degrade replication, not the call.

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::classifier::{self, CallMetadata};
use crate::context;
use crate::invoker::{InvokeResult, OperationInvoker};
use crate::message::ReplicationMessage;
use crate::metrics;
use crate::routing;
use crate::transport::Transport;
use crate::types::{OperationRef, TypeDescriptor, WriteMode};
use crate::write_mode::WriteModeStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// One intercepted data-access call.
#[derive(Debug, Clone)]
pub struct DataCall {
    pub operation: OperationRef,
    pub metadata: CallMetadata,
    pub arg_types: Vec<TypeDescriptor>,
    pub args: Vec<Value>,
}

impl DataCall {
    /// Call classified by the operation name alone.
    pub fn new(operation: OperationRef, arg_types: Vec<TypeDescriptor>, args: Vec<Value>) -> Self {
        let metadata = CallMetadata::for_operation(&operation);
        Self {
            operation,
            metadata,
            arg_types,
            args,
        }
    }

    /// Replace the classification metadata (command tag, statement text).
    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Routes calls to the selected store and enqueues the second write.
pub struct Dispatcher {
    invoker: Arc<dyn OperationInvoker>,
    modes: Arc<dyn WriteModeStore>,
    transport: Option<Arc<dyn Transport>>,
    send_circuit: CircuitBreaker,
}

impl Dispatcher {
    pub fn new(
        invoker: Arc<dyn OperationInvoker>,
        modes: Arc<dyn WriteModeStore>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        Self::with_circuit(invoker, modes, transport, CircuitConfig::default())
    }

    pub fn with_circuit(
        invoker: Arc<dyn OperationInvoker>,
        modes: Arc<dyn WriteModeStore>,
        transport: Option<Arc<dyn Transport>>,
        circuit: CircuitConfig,
    ) -> Self {
        Self {
            invoker,
            modes,
            transport,
            send_circuit: CircuitBreaker::new("transport_send", circuit),
        }
    }

    /// Breaker guarding `Transport::send`, for health reporting.
    pub fn send_circuit(&self) -> &CircuitBreaker {
        &self.send_circuit
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Execute `call` under the current write mode.
    ///
    /// Returns the first write's result unchanged. On a successful dual-write
    /// call, one replication message is handed to the transport before returning.
    pub async fn handle(&self, call: DataCall) -> InvokeResult<Value> {
        let kind = classifier::classify(&call.metadata);
        let mode = self.modes.get().await;
        let route = routing::route(mode, kind);
        let path = if route.is_dual() { "dual" } else { "single" };
        metrics::record_dispatch(kind.as_str(), mode.as_str(), path);

        debug!(
            operation = %call.operation,
            kind = %kind,
            mode = %mode,
            first = %route.first,
            path,
            "Dispatching call"
        );

        let start = Instant::now();
        let result = context::scope(route.first, async {
            self.invoker
                .invoke(route.first, &call.operation, &call.arg_types, &call.args)
                .await
        })
        .await;
        metrics::record_first_write(route.first.as_str(), result.is_ok(), start.elapsed());

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                debug!(operation = %call.operation, target = %route.first, error = %e, "First write failed");
                return Err(e);
            }
        };

        if let Some(second) = route.second {
            let message = ReplicationMessage::new(
                call.operation,
                kind,
                call.arg_types,
                call.args,
                second,
            );
            self.enqueue(message, mode).await;
        }

        Ok(value)
    }

    /// Hand a message to the transport. Never fails the caller.
    async fn enqueue(&self, message: ReplicationMessage, mode: WriteMode) {
        let Some(transport) = &self.transport else {
            error!(
                message_id = %message.message_id,
                operation = %message.operation,
                mode = %mode,
                "No replication transport configured, second write skipped"
            );
            metrics::record_enqueue("no_transport");
            return;
        };

        match self.send_circuit.call(|| transport.send(&message)).await {
            Ok(()) => {
                metrics::record_enqueue("sent");
                debug!(
                    message_id = %message.message_id,
                    operation = %message.operation,
                    target = %message.target_store,
                    "Replication enqueued"
                );
            }
            Err(CircuitError::Rejected) => {
                metrics::record_enqueue("rejected");
                warn!(
                    message_id = %message.message_id,
                    operation = %message.operation,
                    target = %message.target_store,
                    "Transport circuit open, second write dropped"
                );
            }
            Err(CircuitError::Inner(e)) => {
                metrics::record_enqueue("failed");
                error!(
                    message_id = %message.message_id,
                    operation = %message.operation,
                    target = %message.target_store,
                    transport = transport.name(),
                    error = %e,
                    "Failed to enqueue replication, second write dropped"
                );
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &self.transport.as_ref().map(|t| t.name()))
            .field("send_circuit", &self.send_circuit)
            .finish()
    }
}
