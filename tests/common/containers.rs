// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.

use redis::aio::ConnectionManager;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams + XAUTOCLAIM need 6.2+).
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// Open a fresh ConnectionManager.
pub async fn connection_manager(url: &str) -> ConnectionManager {
    let client = redis::Client::open(url).unwrap();
    client.get_connection_manager().await.unwrap()
}

/// A Redis container plus its URL, kept alive for the test's duration.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self { container, url }
    }

    pub async fn connection(&self) -> ConnectionManager {
        connection_manager(&self.url).await
    }

    /// Raw string value of a key.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.connection().await;
        redis::cmd("GET").arg(key).query_async(&mut conn).await.unwrap()
    }

    /// Overwrite a key, bypassing the engine.
    pub async fn set(&self, key: &str, value: &str) {
        let mut conn = self.connection().await;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .unwrap();
    }

    pub async fn ttl(&self, key: &str) -> i64 {
        let mut conn = self.connection().await;
        redis::cmd("TTL").arg(key).query_async(&mut conn).await.unwrap()
    }

    pub async fn zcard(&self, key: &str) -> usize {
        let mut conn = self.connection().await;
        redis::cmd("ZCARD").arg(key).query_async(&mut conn).await.unwrap()
    }

    pub async fn xlen(&self, key: &str) -> usize {
        let mut conn = self.connection().await;
        redis::cmd("XLEN").arg(key).query_async(&mut conn).await.unwrap()
    }
}
