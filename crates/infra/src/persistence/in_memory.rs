use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::r#trait::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory key-value store.
///
/// Intended for tests/dev and single-process deployments. Expired keys are
/// dropped lazily on access. `set_available(false)` simulates an outage:
/// every call fails with [`StoreError::Unavailable`] until it is switched
/// back on.
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    values: RwLock<HashMap<String, StoredValue>>,
    available: AtomicBool,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.values().filter(|v| v.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        {
            let values = self.values.read().unwrap_or_else(|e| e.into_inner());
            match values.get(key) {
                Some(v) if v.is_live(now) => return Ok(Some(v.bytes.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it.
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if values.get(key).is_some_and(|v| !v.is_live(now)) {
            values.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemoryKeyValueStore::new();
        store.put("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        // Deleting again is fine.
        store.delete("k").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_keys() {
        let store = InMemoryKeyValueStore::new();
        store
            .put("k", b"v".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn put_replaces_ttl() {
        let store = InMemoryKeyValueStore::new();
        store
            .put("k", b"1".to_vec(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.put("k", b"2".to_vec(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryKeyValueStore::new();
        store.set_available(false);
        assert_eq!(store.get("k").await, Err(StoreError::Unavailable));
        assert_eq!(
            store.put("k", vec![], None).await,
            Err(StoreError::Unavailable)
        );

        store.set_available(true);
        assert_eq!(store.get("k").await, Ok(None));
    }
}
