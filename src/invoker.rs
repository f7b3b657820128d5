// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation invocation.
//!
//! The engine never knows how a data-access operation is executed. It names the
//! operation, the store, the declared argument types and the argument values, and
//! hands them to an [`OperationInvoker`]. The same invoker runs first writes on the
//! dispatch path and replayed writes on the consumer path.
//!
//! [`OperationRegistry`] is the stock invoker: a table from
//! `(OperationRef, [TypeDescriptor])` to handler, populated at startup. Overloads
//! are distinguished by their descriptor lists, so replay resolves the same
//! handler the original call used.
//!
//! # Example
//!
//! ```rust,no_run
//! use dual_write_engine::invoker::OperationRegistry;
//! use dual_write_engine::types::{OperationRef, StoreTarget};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User { id: u64, name: String }
//!
//! let mut registry = OperationRegistry::new();
//! registry.register_unary(
//!     OperationRef::new("users", "insertUser"),
//!     "User",
//!     |target: StoreTarget, user: User| async move {
//!         // write `user` to `target` ...
//!         Ok(user.id)
//!     },
//! );
//! ```

use crate::types::{OperationRef, StoreTarget, TypeDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Type alias for boxed async futures (keeps trait signatures object safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for invoked operations.
pub type InvokeResult<T> = std::result::Result<T, InvokeError>;

/// Errors raised while invoking a data-access operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// No handler is registered for this operation and descriptor list.
    #[error("unknown operation {operation}({arg_types})")]
    UnknownOperation { operation: String, arg_types: String },

    /// Argument count or shape does not match the handler.
    #[error("argument mismatch for {operation}: {message}")]
    ArgumentMismatch { operation: String, message: String },

    /// The operation ran and failed.
    #[error("operation {operation} failed: {message}")]
    Failed { operation: String, message: String },
}

impl InvokeError {
    pub fn failed(operation: &OperationRef, message: impl Into<String>) -> Self {
        Self::Failed {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn argument_mismatch(operation: &OperationRef, message: impl Into<String>) -> Self {
        Self::ArgumentMismatch {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn unknown(operation: &OperationRef, arg_types: &[TypeDescriptor]) -> Self {
        Self::UnknownOperation {
            operation: operation.to_string(),
            arg_types: join_types(arg_types),
        }
    }
}

fn join_types(arg_types: &[TypeDescriptor]) -> String {
    arg_types
        .iter()
        .map(TypeDescriptor::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Executes a named operation against one store.
///
/// Implementations must be safe to call concurrently from the dispatch path and
/// from consumer workers.
pub trait OperationInvoker: Send + Sync + 'static {
    fn invoke<'a>(
        &'a self,
        target: StoreTarget,
        operation: &'a OperationRef,
        arg_types: &'a [TypeDescriptor],
        args: &'a [Value],
    ) -> BoxFuture<'a, InvokeResult<Value>>;
}

impl<T: OperationInvoker + ?Sized> OperationInvoker for Arc<T> {
    fn invoke<'a>(
        &'a self,
        target: StoreTarget,
        operation: &'a OperationRef,
        arg_types: &'a [TypeDescriptor],
        args: &'a [Value],
    ) -> BoxFuture<'a, InvokeResult<Value>> {
        (**self).invoke(target, operation, arg_types, args)
    }
}

/// A registered handler: positional JSON arguments in, JSON result out.
pub type Handler =
    Arc<dyn Fn(StoreTarget, Vec<Value>) -> BoxFuture<'static, InvokeResult<Value>> + Send + Sync>;

type RegistryKey = (OperationRef, Vec<TypeDescriptor>);

/// Startup-populated table of operation handlers.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    handlers: HashMap<RegistryKey, Handler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler. Replaces any handler with the same key.
    pub fn register<F, Fut>(&mut self, operation: OperationRef, arg_types: Vec<TypeDescriptor>, f: F)
    where
        F: Fn(StoreTarget, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvokeResult<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |target, args| -> BoxFuture<'static, InvokeResult<Value>> {
                Box::pin(f(target, args))
            },
        );
        self.handlers.insert((operation, arg_types), handler);
    }

    /// Register a single-argument handler with typed input and output.
    pub fn register_unary<A, R, F, Fut>(
        &mut self,
        operation: OperationRef,
        arg_type: impl Into<TypeDescriptor>,
        f: F,
    ) where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(StoreTarget, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvokeResult<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let op = operation.clone();
        self.register(operation, vec![arg_type.into()], move |target, mut args| {
            let f = Arc::clone(&f);
            let op = op.clone();
            async move {
                let raw = args.pop().unwrap_or(Value::Null);
                let arg: A = serde_json::from_value(raw)
                    .map_err(|e| InvokeError::argument_mismatch(&op, e.to_string()))?;
                let out = f(target, arg).await?;
                serde_json::to_value(out).map_err(|e| InvokeError::failed(&op, e.to_string()))
            }
        });
    }

    pub fn contains(&self, operation: &OperationRef, arg_types: &[TypeDescriptor]) -> bool {
        self.handlers
            .contains_key(&(operation.clone(), arg_types.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .handlers
            .keys()
            .map(|(op, types)| format!("{}({})", op, join_types(types)))
            .collect();
        keys.sort();
        f.debug_struct("OperationRegistry").field("handlers", &keys).finish()
    }
}

impl OperationInvoker for OperationRegistry {
    fn invoke<'a>(
        &'a self,
        target: StoreTarget,
        operation: &'a OperationRef,
        arg_types: &'a [TypeDescriptor],
        args: &'a [Value],
    ) -> BoxFuture<'a, InvokeResult<Value>> {
        Box::pin(async move {
            if arg_types.len() != args.len() {
                return Err(InvokeError::argument_mismatch(
                    operation,
                    format!("{} type descriptors for {} arguments", arg_types.len(), args.len()),
                ));
            }
            let handler = self
                .handlers
                .get(&(operation.clone(), arg_types.to_vec()))
                .cloned()
                .ok_or_else(|| InvokeError::unknown(operation, arg_types))?;
            handler(target, args.to_vec()).await
        })
    }
}
