// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Dual-Write Engine
//!
//! Keeps two data stores in step during a migration: every write lands on one
//! store synchronously and is replayed on the other asynchronously.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            dual-write-engine                             │
//! │                                                                          │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────────────────────┐   │
//! │  │ Classifier │──►│  Routing   │──►│ Dispatcher: first write (sync)  │   │
//! │  │ (kind)     │   │ (mode)     │   │ + ReplicationMessage → transport│   │
//! │  └────────────┘   └────────────┘   └─────────────────────────────────┘   │
//! │                         ▲                          │                     │
//! │                  ┌──────┴──────┐                   ▼                     │
//! │                  │ WriteMode   │        ┌──────────────────────┐         │
//! │                  │ store       │        │ Transport (memory or │         │
//! │                  └─────────────┘        │ Redis streams)       │         │
//! │                                         └──────────┬───────────┘         │
//! │                                                    ▼                     │
//! │  ┌──────────────┐   ┌──────────────────────────────────────────────┐     │
//! │  │ Dead letters │◄──│ ReplicationConsumer: idempotency check,      │     │
//! │  │ (SQLite)     │   │ replay, bounded delayed retry                │     │
//! │  └──────────────┘   └──────────────────────────────────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Modes
//!
//! | Mode | First write | Second write |
//! |------|-------------|--------------|
//! | `PrimaryOnly` | primary | none |
//! | `PrimaryThenSecondary` | primary | secondary, async |
//! | `SecondaryThenPrimary` | secondary | primary, async |
//! | `SecondaryOnly` | secondary | none |
//!
//! Reads always go to the first store only. There is no distributed
//! transaction: a second write that keeps failing is retried on a fixed
//! schedule and then dead-lettered.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dual_write_engine::{DataCall, DualWriteConfig, DualWriteEngine, OperationRegistry};
//! use dual_write_engine::types::{OperationRef, StoreTarget, TypeDescriptor, WriteMode};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = OperationRegistry::new();
//!     registry.register_unary(
//!         OperationRef::new("users", "insertUser"),
//!         "User",
//!         |_target: StoreTarget, user: serde_json::Value| async move { Ok(user) },
//!     );
//!
//!     let engine = DualWriteEngine::new(DualWriteConfig::default(), Arc::new(registry)).await?;
//!     engine.set_write_mode(WriteMode::PrimaryThenSecondary).await?;
//!     engine.start().await?;
//!
//!     let call = DataCall::new(
//!         OperationRef::new("users", "insertUser"),
//!         vec![TypeDescriptor::new("User")],
//!         vec![json!({ "id": 1 })],
//!     );
//!     engine.dispatcher().handle(call).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod context;
pub mod coordinator;
pub mod dead_letter;
pub mod dispatch;
pub mod error;
pub mod idempotency;
pub mod invoker;
pub mod message;
pub mod metrics;
pub mod redis_conn;
pub mod resilience;
pub mod routing;
pub mod transport;
pub mod types;
pub mod write_mode;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use classifier::{classify, CallMetadata, CommandTag};
pub use config::{DualWriteConfig, MqBackend, MqConfig};
pub use consumer::{ConsumeOutcome, ReplicationConsumer};
pub use coordinator::{DualWriteEngine, EngineState, HealthCheck};
pub use dead_letter::{DeadLetterHook, LogDeadLetter, SqliteDeadLetterStore};
pub use dispatch::{DataCall, Dispatcher};
pub use error::{DualWriteError, Result};
pub use idempotency::{IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore};
pub use invoker::{InvokeError, OperationInvoker, OperationRegistry};
pub use message::ReplicationMessage;
pub use resilience::RetrySchedule;
pub use routing::{needs_dual_write, select_first_target, select_second_target};
pub use transport::{MemoryTransport, RedisStreamTransport, Transport};
pub use types::{OperationKind, OperationRef, StoreTarget, TypeDescriptor, WriteMode};
pub use write_mode::{MemoryWriteModeStore, RedisWriteModeStore, WriteModeStore};
