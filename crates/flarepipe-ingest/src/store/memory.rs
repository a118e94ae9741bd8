//! In-process document store
//!
//! Used by `--dry-run` and by tests. Clones share the same data, so the
//! store can serve as its own connector.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{json_contains, DocumentStore, StoreConnector, UpsertOutcome};
use crate::error::StoreError;

type Collections = HashMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collections>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .ok()?
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map(|c| c.values().all(BTreeMap::is_empty)).unwrap_or(true)
    }

    /// Snapshot of every document, for comparing store state across runs
    pub fn snapshot(&self) -> BTreeMap<(String, String), Value> {
        self.lock()
            .map(|collections| {
                collections
                    .iter()
                    .flat_map(|(name, docs)| {
                        docs.iter()
                            .map(move |(id, doc)| ((name.clone(), id.clone()), doc.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut collections = self.lock()?;
        let previous = collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document.clone());

        Ok(match previous {
            Some(_) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
        let collections = self.lock()?;
        let count = collections
            .get(collection)
            .map_or(0, |docs| docs.values().filter(|doc| json_contains(doc, filter)).count());
        Ok(count as u64)
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_replaces_last_write_wins() {
        let store = MemoryStore::new();

        let first = store.upsert("dns_raw", "a", &json!({"v": 1})).await.unwrap();
        let second = store.upsert("dns_raw", "a", &json!({"v": 2})).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Replaced);
        assert_eq!(store.len("dns_raw"), 1);
        assert_eq!(store.get("dns_raw", "a").unwrap(), json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let store = MemoryStore::new();
        store.upsert("a", "x", &json!({})).await.unwrap();
        store.upsert("b", "x", &json!({})).await.unwrap();

        assert_eq!(store.len("a"), 1);
        assert_eq!(store.len("b"), 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_count_with_filter() {
        let store = MemoryStore::new();
        store.upsert("dns_raw", "1", &json!({"response_code": "NOERROR"})).await.unwrap();
        store.upsert("dns_raw", "2", &json!({"response_code": "NXDOMAIN"})).await.unwrap();

        assert_eq!(store.count("dns_raw", &json!({})).await.unwrap(), 2);
        assert_eq!(
            store
                .count("dns_raw", &json!({"response_code": "NOERROR"}))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.count("absent", &json!({})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connected_handles_share_data() {
        let store = MemoryStore::new();
        let handle = store.connect().await.unwrap();
        handle.upsert("trace_raw", "t", &json!({})).await.unwrap();

        assert_eq!(store.len("trace_raw"), 1);
    }
}
