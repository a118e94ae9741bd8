//! Load stage: idempotent upserts into the document store
//!
//! A record whose identity already exists replaces the stored document
//! (last write wins). When the store reports a lost connection the loader
//! reconnects once and retries the write; a second failure becomes a
//! per-record [`LoadError`].

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{LoadError, StoreError};
use crate::store::{DocumentStore, StoreConnector, UpsertOutcome};
use crate::transform::NormalizedRecord;

pub struct Loader {
    connector: Arc<dyn StoreConnector>,
    store: Box<dyn DocumentStore>,
}

impl Loader {
    /// Open the store handle used for the rest of the run
    pub async fn connect(connector: Arc<dyn StoreConnector>) -> Result<Self, StoreError> {
        let store = connector.connect().await?;
        Ok(Self { connector, store })
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.store = self.connector.connect().await?;
        info!("Reconnected to document store");
        Ok(())
    }

    pub async fn upsert(&mut self, record: &NormalizedRecord) -> Result<UpsertOutcome, LoadError> {
        let document = record.to_document();
        let load_error = |source: StoreError| LoadError {
            collection: record.collection.clone(),
            id: record.id.clone(),
            source,
        };

        let outcome = match self.store.upsert(&record.collection, &record.id, &document).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_connection_error() => {
                warn!(id = %record.id, error = %e, "Store connection lost, reconnecting");
                self.reconnect().await.map_err(load_error)?;
                self.store
                    .upsert(&record.collection, &record.id, &document)
                    .await
                    .map_err(load_error)?
            },
            Err(e) => return Err(load_error(e)),
        };

        if outcome == UpsertOutcome::Replaced {
            info!(
                collection = %record.collection,
                id = %record.id,
                "Replaced existing document"
            );
        }
        Ok(outcome)
    }

    pub async fn count(&mut self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
        match self.store.count(collection, filter).await {
            Err(e) if e.is_connection_error() => {
                warn!(collection, error = %e, "Store connection lost, reconnecting");
                self.reconnect().await?;
                self.store.count(collection, filter).await
            },
            result => result,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store whose first `failures` writes report a lost connection
    pub(crate) struct FlakyStore {
        inner: MemoryStore,
        failures: Arc<AtomicU32>,
        rejected: bool,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn upsert(
            &self,
            collection: &str,
            id: &str,
            document: &Value,
        ) -> Result<UpsertOutcome, StoreError> {
            if self.rejected {
                return Err(StoreError::Rejected("value too long".to_string()));
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.upsert(collection, id, document).await
        }

        async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
            self.inner.count(collection, filter).await
        }
    }

    /// Connector handing out [`FlakyStore`]s that share one failure budget
    pub(crate) struct FlakyConnector {
        pub(crate) inner: MemoryStore,
        pub(crate) failures: Arc<AtomicU32>,
        pub(crate) connects: AtomicU32,
        pub(crate) rejected: bool,
    }

    impl FlakyConnector {
        pub(crate) fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: Arc::new(AtomicU32::new(failures)),
                connects: AtomicU32::new(0),
                rejected: false,
            }
        }
    }

    #[async_trait]
    impl StoreConnector for FlakyConnector {
        async fn connect(&self) -> Result<Box<dyn DocumentStore>, StoreError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyStore {
                inner: self.inner.clone(),
                failures: self.failures.clone(),
                rejected: self.rejected,
            }))
        }
    }

    fn record(id: &str) -> NormalizedRecord {
        let mut fields = Map::new();
        fields.insert("colo".to_string(), json!("AMS"));
        NormalizedRecord {
            id: id.to_string(),
            collection: "trace_raw".to_string(),
            fields,
            ingested_at: chrono::Utc::now(),
            source_api: "Cloudflare Trace".to_string(),
            raw_data: json!({"colo": "AMS"}),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_replace() {
        let store = MemoryStore::new();
        let mut loader = Loader::connect(Arc::new(store.clone())).await.unwrap();

        assert_eq!(loader.upsert(&record("t1")).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(loader.upsert(&record("t1")).await.unwrap(), UpsertOutcome::Replaced);
        assert_eq!(store.len("trace_raw"), 1);
        assert_eq!(store.get("trace_raw", "t1").unwrap()["_id"], "t1");
        assert_eq!(loader.count("trace_raw", &json!({"colo": "AMS"})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_once_on_connection_loss() {
        let connector = Arc::new(FlakyConnector::new(1));
        let mut loader = Loader::connect(connector.clone()).await.unwrap();

        let outcome = loader.upsert(&record("t1")).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.inner.len("trace_raw"), 1);
    }

    #[tokio::test]
    async fn test_second_failure_is_a_record_error() {
        let connector = Arc::new(FlakyConnector::new(2));
        let mut loader = Loader::connect(connector.clone()).await.unwrap();

        let err = loader.upsert(&record("t1")).await.unwrap_err();
        assert_eq!(err.id, "t1");
        assert!(err.source.is_connection_error());

        // the loader stays usable for the next record
        assert!(loader.upsert(&record("t2")).await.is_ok());
        assert_eq!(connector.inner.len("trace_raw"), 1);
    }

    #[tokio::test]
    async fn test_rejected_write_does_not_reconnect() {
        let mut connector = FlakyConnector::new(0);
        connector.rejected = true;
        let connector = Arc::new(connector);
        let mut loader = Loader::connect(connector.clone()).await.unwrap();

        let err = loader.upsert(&record("t1")).await.unwrap_err();

        assert!(matches!(err.source, StoreError::Rejected(_)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }
}
