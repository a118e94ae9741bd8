//! Document store capability
//!
//! A [`StoreConnector`] opens a [`DocumentStore`] handle; the loader owns the
//! handle for the duration of a run and asks the connector for a fresh one
//! when the connection is lost.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use postgres::{PgConnector, PgDocumentStore};

/// Whether an upsert created a document or replaced an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or wholly replace the document stored under `(collection, id)`
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Count documents in `collection` that contain `filter` (`{}` matches all)
    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>, StoreError>;
}

/// JSON containment with PostgreSQL `@>` semantics: every field in `filter`
/// is present in `document` with a containing value, and an array contains a
/// filter array when each filter element is contained in some document
/// element. Only a top-level array may contain a bare scalar.
pub fn json_contains(document: &Value, filter: &Value) -> bool {
    match (document, filter) {
        (Value::Array(doc), scalar) if !scalar.is_object() && !scalar.is_array() => {
            doc.contains(scalar)
        },
        _ => contains(document, filter),
    }
}

fn contains(document: &Value, filter: &Value) -> bool {
    match (document, filter) {
        (Value::Object(doc), Value::Object(want)) => want
            .iter()
            .all(|(key, value)| doc.get(key).is_some_and(|found| contains(found, value))),
        (Value::Array(doc), Value::Array(want)) => want
            .iter()
            .all(|value| doc.iter().any(|found| contains(found, value))),
        (found, value) => found == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_contains() {
        let doc = json!({
            "response_code": "NOERROR",
            "answers": [{"type": 1, "data": "1.2.3.4"}, {"type": 5, "data": "alias."}],
            "flags": {"rd": true, "ra": true}
        });

        assert!(json_contains(&doc, &json!({})));
        assert!(json_contains(&doc, &json!({"response_code": "NOERROR"})));
        assert!(json_contains(&doc, &json!({"flags": {"rd": true}})));
        assert!(json_contains(&doc, &json!({"answers": [{"type": 5}]})));
        assert!(!json_contains(&doc, &json!({"response_code": "NXDOMAIN"})));
        assert!(!json_contains(&doc, &json!({"missing": null})));
        assert!(!json_contains(&doc, &json!({"answers": [{"type": 28}]})));
    }

    #[test]
    fn test_scalar_matches_array_only_at_top_level() {
        assert!(json_contains(&json!(["a", "b"]), &json!("a")));
        assert!(!json_contains(&json!(["a", "b"]), &json!("c")));

        let doc = json!({"cwe_ids": ["CWE-79", "CWE-89"], "nested": [[1, 2]]});
        assert!(!json_contains(&doc, &json!({"cwe_ids": "CWE-79"})));
        assert!(json_contains(&doc, &json!({"cwe_ids": ["CWE-79"]})));
        assert!(!json_contains(&doc, &json!({"nested": [1]})));
        assert!(json_contains(&doc, &json!({"nested": [[2]]})));
    }
}
