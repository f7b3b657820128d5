// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Test doubles for the invoker and transport.

use dual_write_engine::context;
use dual_write_engine::dispatch::DataCall;
use dual_write_engine::error::{DualWriteError, Result};
use dual_write_engine::invoker::{BoxFuture, InvokeError, InvokeResult, OperationInvoker};
use dual_write_engine::message::ReplicationMessage;
use dual_write_engine::transport::{Delivery, MemoryTransport, Receipt, Transport, TransportDepth};
use dual_write_engine::types::{OperationKind, OperationRef, StoreTarget, TypeDescriptor};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub target: StoreTarget,
    /// Store selected by the enclosing scope when the call ran.
    pub scoped: Option<StoreTarget>,
    pub operation: String,
    pub args: Vec<Value>,
}

/// Two in-memory "databases" keyed by `args[0].id`.
///
/// Operation names decide the effect: `insert*`/`save*`/`update*` upsert,
/// `delete*` removes, `find*` reads, anything else is a no-op.
#[derive(Default)]
pub struct FakeStores {
    rows: Mutex<HashMap<StoreTarget, BTreeMap<i64, Value>>>,
    calls: Mutex<Vec<RecordedCall>>,
    /// Remaining forced failures per store.
    failures: Mutex<HashMap<StoreTarget, u32>>,
}

impl FakeStores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` calls against `target`.
    pub fn fail_next(&self, target: StoreTarget, times: u32) {
        self.failures.lock().unwrap().insert(target, times);
    }

    /// Fail every call against `target`.
    pub fn fail_always(&self, target: StoreTarget) {
        self.fail_next(target, u32::MAX);
    }

    pub fn heal(&self, target: StoreTarget) {
        self.failures.lock().unwrap().remove(&target);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_on(&self, target: StoreTarget) -> usize {
        self.calls().iter().filter(|c| c.target == target).count()
    }

    pub fn row(&self, target: StoreTarget, id: i64) -> Option<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(&target)
            .and_then(|rows| rows.get(&id).cloned())
    }

    pub fn row_count(&self, target: StoreTarget) -> usize {
        self.rows
            .lock()
            .unwrap()
            .get(&target)
            .map_or(0, BTreeMap::len)
    }

    fn should_fail(&self, target: StoreTarget) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&target) {
            Some(0) | None => false,
            Some(n) if *n == u32::MAX => true,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

impl OperationInvoker for FakeStores {
    fn invoke<'a>(
        &'a self,
        target: StoreTarget,
        operation: &'a OperationRef,
        _arg_types: &'a [TypeDescriptor],
        args: &'a [Value],
    ) -> BoxFuture<'a, InvokeResult<Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(RecordedCall {
                target,
                scoped: context::current_store(),
                operation: operation.operation.clone(),
                args: args.to_vec(),
            });

            if self.should_fail(target) {
                return Err(InvokeError::failed(operation, format!("{target} unavailable")));
            }

            let row = args.first().cloned().unwrap_or(Value::Null);
            let id = row.get("id").and_then(Value::as_i64).unwrap_or_default();
            let name = operation.operation.to_ascii_lowercase();
            let mut rows = self.rows.lock().unwrap();
            let table = rows.entry(target).or_default();

            if name.starts_with("insert") || name.starts_with("save") || name.starts_with("update") {
                table.insert(id, row.clone());
                Ok(row)
            } else if name.starts_with("delete") {
                Ok(json!(table.remove(&id).is_some()))
            } else if name.starts_with("find") {
                Ok(table.get(&id).cloned().unwrap_or(Value::Null))
            } else {
                Ok(Value::Null)
            }
        })
    }
}

/// Memory transport with switchable failures.
pub struct FlakyTransport {
    pub inner: MemoryTransport,
    fail_send: AtomicBool,
    fail_send_delayed: AtomicBool,
    fail_receives: AtomicU32,
}

impl FlakyTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryTransport::recording(),
            fail_send: AtomicBool::new(false),
            fail_send_delayed: AtomicBool::new(false),
            fail_receives: AtomicU32::new(0),
        })
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send_delayed(&self, fail: bool) {
        self.fail_send_delayed.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `times` receives.
    pub fn fail_receives(&self, times: u32) {
        self.fail_receives.store(times, Ordering::SeqCst);
    }

    fn down() -> DualWriteError {
        DualWriteError::transport("flaky", "broker unavailable")
    }
}

impl Transport for FlakyTransport {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn send<'a>(&'a self, message: &'a ReplicationMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(Self::down());
            }
            self.inner.send(message).await
        })
    }

    fn send_delayed<'a>(
        &'a self,
        message: &'a ReplicationMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_send_delayed.load(Ordering::SeqCst) {
                return Err(Self::down());
            }
            self.inner.send_delayed(message, delay).await
        })
    }

    fn receive(&self, max: usize, block: Duration) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move {
            let remaining = self.fail_receives.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_receives.store(remaining - 1, Ordering::SeqCst);
                return Err(Self::down());
            }
            self.inner.receive(max, block).await
        })
    }

    fn ack<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<()>> {
        self.inner.ack(receipt)
    }

    fn reclaim(&self, min_idle: Duration, max: usize) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        self.inner.reclaim(min_idle, max)
    }

    fn depth(&self) -> BoxFuture<'_, Result<TransportDepth>> {
        self.inner.depth()
    }
}

/// A call on the `users` collection with a single `User` argument.
pub fn user_call(operation: &str, id: i64, name: &str) -> DataCall {
    DataCall::new(
        OperationRef::new("users", operation),
        vec![TypeDescriptor::new("User")],
        vec![json!({ "id": id, "name": name })],
    )
}

pub fn user_message(operation: &str, id: i64, target: StoreTarget) -> ReplicationMessage {
    ReplicationMessage::new(
        OperationRef::new("users", operation),
        OperationKind::Update,
        vec![TypeDescriptor::new("User")],
        vec![json!({ "id": id, "name": "replayed" })],
        target,
    )
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
