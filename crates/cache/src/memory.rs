//! In-memory byte store.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::store::{ensure_not_empty, ByteStore, StoreError};

/// HashMap-backed store, mainly for tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl ByteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        ensure_not_empty(key, &bytes)?;
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn total_size(&self) -> Result<u64, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.values().map(|bytes| bytes.len() as u64).sum())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryStore::new();
        store.put("model", vec![1, 2, 3]).await.unwrap();

        assert_eq!(store.get("model").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(store.contains("model").await.unwrap());
    }

    #[tokio::test]
    async fn missing_key_is_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert!(!store.contains("nope").await.unwrap());
    }

    #[tokio::test]
    async fn empty_payload_is_refused() {
        let store = MemoryStore::new();
        let err = store.put("model", vec![]).await.unwrap_err();
        assert_matches!(err, StoreError::EmptyPayload(key) if key == "model");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn put_replaces_previous_value() {
        let store = MemoryStore::new();
        store.put("model", vec![1]).await.unwrap();
        store.put("model", vec![2, 3]).await.unwrap();

        assert_eq!(store.get("model").await.unwrap(), Some(vec![2, 3]));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = MemoryStore::new();
        store.put("model", vec![1]).await.unwrap();

        assert!(store.remove("model").await.unwrap());
        assert!(!store.remove("model").await.unwrap());
    }

    #[tokio::test]
    async fn total_size_sums_payloads() {
        let store = MemoryStore::new();
        store.put("a", vec![0; 10]).await.unwrap();
        store.put("b", vec![0; 32]).await.unwrap();

        assert_eq!(store.total_size().await.unwrap(), 42);

        store.clear().await.unwrap();
        assert_eq!(store.total_size().await.unwrap(), 0);
    }
}
