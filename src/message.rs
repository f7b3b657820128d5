// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication message: wire contract between dispatcher and consumer.
//!
//! # Lifecycle
//!
//! ```text
//! Dispatcher (first write ok) ──new()──► Transport ──deliver──► Consumer
//!                                            ▲                     │
//!                                            └──send_delayed───────┘ (failed, retry_count <= max)
//! ```
//!
//! A message is created exactly once, when a dual-write call's first write
//! succeeds. Only the consumer mutates it afterwards, and only `retry_count` and
//! `succeeded`. `target_store` is fixed at creation so a later write-mode change
//! cannot redirect an already queued replication.

use crate::types::{OperationKind, OperationRef, StoreTarget, TypeDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A deferred second write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    /// Globally unique, also the idempotency key.
    pub message_id: String,
    /// Operation to replay on the second store.
    pub operation: OperationRef,
    pub operation_kind: OperationKind,
    /// Declared argument types, positional with `args`.
    pub arg_types: Vec<TypeDescriptor>,
    pub args: Vec<Value>,
    pub created_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// `None` until the first attempt, then the outcome of the latest attempt.
    #[serde(default)]
    pub succeeded: Option<bool>,
    /// Store the second write must land on.
    pub target_store: StoreTarget,
}

impl ReplicationMessage {
    /// Build a fresh message with a new id, `retry_count = 0` and no outcome yet.
    pub fn new(
        operation: OperationRef,
        operation_kind: OperationKind,
        arg_types: Vec<TypeDescriptor>,
        args: Vec<Value>,
        target_store: StoreTarget,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            operation,
            operation_kind,
            arg_types,
            args,
            created_at: Utc::now(),
            retry_count: 0,
            succeeded: None,
            target_store,
        }
    }

    /// Record a successful attempt.
    pub fn mark_succeeded(&mut self) {
        self.succeeded = Some(true);
    }

    /// Record a failed attempt and return the new retry count.
    pub fn mark_failed(&mut self) -> u32 {
        self.succeeded = Some(false);
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Age of the message since the first write.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}
