// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing policy: (write mode, operation kind) → store(s).
//!
//! Pure functions, no I/O. Anomalies are logged and resolved to a default,
//! never returned as errors: routing must always name a store.
//!
//! | Mode | First target | Dual-write (non-read) | Second target |
//! |------|--------------|-----------------------|---------------|
//! | `PrimaryOnly` | Primary | no | (Secondary, fallback) |
//! | `PrimaryThenSecondary` | Primary | yes | Secondary |
//! | `SecondaryThenPrimary` | Secondary | yes | Primary |
//! | `SecondaryOnly` | Secondary | no | (Primary, fallback) |

use crate::metrics;
use crate::types::{OperationKind, StoreTarget, WriteMode};
use tracing::warn;

/// The store(s) a single call is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Store written (or read) synchronously.
    pub first: StoreTarget,
    /// Store the replicated write lands on, if the call is dual-written.
    pub second: Option<StoreTarget>,
}

impl Route {
    pub fn is_dual(&self) -> bool {
        self.second.is_some()
    }
}

/// Store that receives the synchronous part of a call.
pub fn select_first_target(mode: WriteMode) -> StoreTarget {
    match mode {
        WriteMode::PrimaryOnly | WriteMode::PrimaryThenSecondary => StoreTarget::Primary,
        WriteMode::SecondaryOnly | WriteMode::SecondaryThenPrimary => StoreTarget::Secondary,
    }
}

/// Resolve a raw stored mode value to a first target.
///
/// Unrecognized values route to the primary store and are logged as a policy anomaly.
pub fn select_first_target_raw(raw: &str) -> StoreTarget {
    match raw.parse::<WriteMode>() {
        Ok(mode) => select_first_target(mode),
        Err(e) => {
            warn!(raw_mode = %raw, error = %e, "Unknown write mode, routing to primary");
            metrics::record_policy_anomaly("unknown_mode");
            StoreTarget::Primary
        }
    }
}

/// Whether a call of `kind` under `mode` must also be written to the second store.
///
/// Reads are never replicated.
pub fn needs_dual_write(mode: WriteMode, kind: OperationKind) -> bool {
    if kind == OperationKind::Read {
        return false;
    }
    mode.is_dual()
}

/// Store that receives the replicated write.
///
/// Only meaningful for the two dual-write modes. For single-store modes this
/// returns the complement of [`select_first_target`] and logs a warning; callers
/// must not depend on that fallback.
pub fn select_second_target(mode: WriteMode) -> StoreTarget {
    match mode {
        WriteMode::PrimaryThenSecondary => StoreTarget::Secondary,
        WriteMode::SecondaryThenPrimary => StoreTarget::Primary,
        WriteMode::PrimaryOnly | WriteMode::SecondaryOnly => {
            let fallback = select_first_target(mode).complement();
            warn!(
                mode = %mode,
                fallback = %fallback,
                "Second target requested outside a dual-write mode"
            );
            metrics::record_policy_anomaly("second_target_outside_dual_mode");
            fallback
        }
    }
}

/// Full routing decision for one call.
pub fn route(mode: WriteMode, kind: OperationKind) -> Route {
    let first = select_first_target(mode);
    let second = if needs_dual_write(mode, kind) {
        Some(select_second_target(mode))
    } else {
        None
    };
    Route { first, second }
}
