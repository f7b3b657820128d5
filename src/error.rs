// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Errors raised by the engine's own plumbing.
//!
//! Failures of the data-access layer are [`crate::invoker::InvokeError`] and
//! never pass through here, so a failed first write reaches the caller as the
//! invoker produced it. What remains is broker, Redis, SQLite and wire trouble.
//! Only the broker-side variants clear up on their own; the rest need a fix.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DualWriteError>;

#[derive(Error, Debug)]
pub enum DualWriteError {
    /// Stream transport, idempotency markers or the write-mode key.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    #[error("Transport error ({transport}): {message}")]
    Transport { transport: String, message: String },

    #[error("Dead-letter store error: {0}")]
    DeadLetterStore(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad zstd frame, hash mismatch or a stream entry missing a field.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Lifecycle call in the wrong engine state, e.g. a second `start()`.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl DualWriteError {
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Whether waiting and trying again can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Redis { .. } | Self::Transport { .. })
    }
}

impl From<redis::RedisError> for DualWriteError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_trouble_is_transient() {
        let redis = DualWriteError::redis_msg("XADD", "connection reset");
        let broker = DualWriteError::transport("memory", "closed");

        assert!(redis.is_retryable());
        assert!(broker.is_retryable());
        assert_eq!(redis.to_string(), "Redis error (XADD): connection reset");
        assert_eq!(broker.to_string(), "Transport error (memory): closed");
    }

    #[test]
    fn local_faults_need_a_fix() {
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let faults = [
            DualWriteError::Config("empty retry schedule".into()),
            DualWriteError::Codec("hash mismatch".into()),
            DualWriteError::from(bad_json),
            DualWriteError::InvalidState {
                expected: "Created".into(),
                actual: "Running".into(),
            },
        ];

        for fault in &faults {
            assert!(!fault.is_retryable(), "{fault} should not be retryable");
        }
        assert!(matches!(faults[2], DualWriteError::Serialization(_)));
    }
}
