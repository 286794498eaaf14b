//! Redis-backed persistence (`redis` feature).
//!
//! - **Key namespace**: every key is prefixed (default `meetflow:`)
//! - **TTL**: `SET key value PX <ms>`; no TTL means a plain `SET`
//! - **Connections**: one multiplexed async connection, opened on first use
//!   and shared by every clone of the store; dropped connections are
//!   reopened on the next call

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::warn;

use super::r#trait::{KeyValueStore, StoreError};

const DEFAULT_PREFIX: &str = "meetflow:";

#[derive(Clone)]
pub struct RedisKeyValueStore {
    client: redis::Client,
    prefix: String,
    connection: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyValueStore")
            .field("client", &self.client)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisKeyValueStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is made until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            connection: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Map a command error, forgetting the shared connection if it broke.
    async fn command_failed(&self, e: redis::RedisError) -> StoreError {
        if e.is_connection_dropped() || e.is_io_error() {
            warn!(error = %e, "redis connection lost; reconnecting on next call");
            *self.connection.lock().await = None;
        }
        StoreError::Command(e.to_string())
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.command_failed(e).await),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            // PX 0 is rejected by Redis.
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }
        match cmd.query_async::<_, ()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.command_failed(e).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, ()>(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.command_failed(e).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_clients(info: &str) -> usize {
        info.lines()
            .find_map(|line| line.strip_prefix("connected_clients:"))
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn unreachable_server_leaves_no_connection_behind() {
        let store = RedisKeyValueStore::new("redis://127.0.0.1:1").unwrap();
        assert!(!store.is_connected().await);

        assert!(matches!(store.get("job:1").await, Err(StoreError::Connection(_))));
        assert!(!store.is_connected().await);
    }

    #[tokio::test]
    #[ignore = "needs a redis server at REDIS_URL"]
    async fn commands_share_one_connection() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisKeyValueStore::new(&url).unwrap().with_prefix("meetflow-test:");
        let mut admin = redis::Client::open(url.as_str())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let clients = |info: String| connected_clients(&info);

        store.put("anchor", b"1".to_vec(), None).await.unwrap();
        let info: String = redis::cmd("INFO").arg("clients").query_async(&mut admin).await.unwrap();
        let baseline = clients(info);

        let clone = store.clone();
        for i in 0..50 {
            let key = format!("k{i}");
            clone.put(&key, vec![1], Some(Duration::from_secs(5))).await.unwrap();
            assert_eq!(store.get(&key).await.unwrap(), Some(vec![1]));
            store.delete(&key).await.unwrap();
        }
        let info: String = redis::cmd("INFO").arg("clients").query_async(&mut admin).await.unwrap();
        assert_eq!(clients(info), baseline);

        store.delete("anchor").await.unwrap();
    }
}
