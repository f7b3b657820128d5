// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis connection establishment shared by the stream transport and the stores.
//!
//! `ConnectionManager` is multiplexed and reconnects on its own once built, so
//! each component clones one manager. Only the initial connect needs retrying.

use crate::error::{DualWriteError, Result};
use crate::metrics;
use crate::resilience::ConnectBackoff;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Connect, retrying with `backoff` until an attempt succeeds or they run out.
pub async fn connect(url: &str, backoff: &ConnectBackoff) -> Result<ConnectionManager> {
    let client = Client::open(url)
        .map_err(|e| DualWriteError::Config(format!("invalid redis_url: {e}")))?;

    let mut pauses = backoff.pauses();
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let failure = match timeout(backoff.attempt_timeout, client.get_connection_manager()).await
        {
            Ok(Ok(conn)) => {
                metrics::record_redis_connection(true);
                info!(attempt, "Connected to Redis");
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {:?}", backoff.attempt_timeout),
        };
        metrics::record_redis_connection(false);

        let Some(pause) = pauses.next() else {
            error!(attempt, error = %failure, "Giving up on Redis");
            return Err(DualWriteError::redis_msg(
                "connect",
                format!("connection failed after {attempt} attempts: {failure}"),
            ));
        };

        warn!(attempt, retry_in = ?pause, error = %failure, "Redis connect failed");
        tokio::time::sleep(pause).await;
    }
}

/// Round-trip a PING; returns the latency.
pub async fn ping(conn: &ConnectionManager) -> Result<Duration> {
    let mut conn = conn.clone();
    let start = Instant::now();

    let reply: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| DualWriteError::redis("PING", e))?;

    if reply == "PONG" {
        Ok(start.elapsed())
    } else {
        Err(DualWriteError::redis_msg(
            "PING",
            format!("unexpected reply: {reply}"),
        ))
    }
}
