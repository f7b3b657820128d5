// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ─────────────────→ Running
//!    │   │                      │
//!    │   │ (transport           │ shutdown()
//!    │   │  unreachable)        ↓
//!    │   └────→ Failed     ShuttingDown
//!    │                          │
//!    │ shutdown()               ↓
//!    └───────────────────→  Stopped
//! ```
//!
//! - **Created**: built, dispatcher usable, no consumer workers yet.
//! - **Running**: consumer workers applying replication messages.
//! - **ShuttingDown**: workers told to stop, in-flight messages finishing.
//! - **Stopped**: all workers joined. Safe to drop.
//! - **Failed**: `start()` could not reach the transport.

use crate::transport::TransportDepth;
use crate::types::WriteMode;
use std::time::Duration;

/// State of the dual-write engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot for readiness/liveness endpoints.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Workers are consuming.
    pub ready: bool,
    pub write_mode: WriteMode,
    pub transport: &'static str,
    /// `None` if the transport could not report its depth.
    pub transport_depth: Option<TransportDepth>,
    /// Round trip to Redis, when one is configured and answered.
    pub redis_latency: Option<Duration>,
    /// The transport-send breaker short-circuited its most recent call.
    pub send_circuit_open: bool,
    pub workers: usize,
    pub in_flight_available: usize,
    /// Persisted dead letters, when a dead-letter store is configured.
    pub dead_letters: Option<u64>,
    /// Ready, transport reachable and its breaker closed.
    pub healthy: bool,
}
