// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Call-scoped store selection.
//!
//! The selected [`StoreTarget`] lives in a tokio task-local for exactly the
//! duration of one future (or one closure). It is restored on every exit path
//! (completion, error, panic and cancellation by drop), and it never leaks to
//! other tasks because task-locals are not inherited by `tokio::spawn`.
//!
//! The invoker also receives the target as an explicit argument; the task-local
//! exists for data-access code deeper in the call that cannot be handed it
//! directly (connection lookup, per-store logging).

use crate::types::StoreTarget;
use std::future::Future;

tokio::task_local! {
    static SELECTED_STORE: StoreTarget;
}

/// Run `fut` with `target` selected. The selection ends when `fut` completes or is dropped.
pub async fn scope<F>(target: StoreTarget, fut: F) -> F::Output
where
    F: Future,
{
    SELECTED_STORE.scope(target, fut).await
}

/// Run a synchronous closure with `target` selected.
pub fn sync_scope<F, R>(target: StoreTarget, f: F) -> R
where
    F: FnOnce() -> R,
{
    SELECTED_STORE.sync_scope(target, f)
}

/// Store selected by the enclosing scope, if any.
pub fn current_store() -> Option<StoreTarget> {
    SELECTED_STORE.try_with(|t| *t).ok()
}
