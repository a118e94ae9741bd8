//! Transform stage: raw payloads to normalized records
//!
//! Each source has a [`Transformer`] that maps a [`RawBatch`] to zero or more
//! [`NormalizedRecord`]s. A payload that does not fit its schema becomes an
//! [`ItemError`]; the rest of the batch is still transformed.

pub mod cve;
pub mod dns;
pub mod speed;
pub mod trace;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ErrorStage, ItemError, TransformError};
use crate::extract::RawBatch;

pub use cve::CveTransformer;
pub use dns::DnsTransformer;
pub use speed::SpeedTransformer;
pub use trace::TraceTransformer;

/// Schema version stamped on every document
pub const ETL_VERSION: &str = "2.0";

/// A record ready to be loaded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    /// Identity; stable for the same logical entity within the same run
    pub id: String,
    pub collection: String,
    pub fields: Map<String, Value>,
    pub ingested_at: DateTime<Utc>,
    pub source_api: String,
    /// Original parsed payload, kept verbatim
    pub raw_data: Value,
}

impl NormalizedRecord {
    pub fn new(batch: &RawBatch, id: String, fields: Map<String, Value>, raw_data: Value) -> Self {
        Self {
            id,
            collection: batch.source.collection.clone(),
            fields,
            ingested_at: batch.run_started_at,
            source_api: batch.source.name.clone(),
            raw_data,
        }
    }

    /// The stored document: source fields plus the pipeline metadata
    pub fn to_document(&self) -> Value {
        let mut document = self.fields.clone();
        document.insert("_id".to_string(), Value::String(self.id.clone()));
        document.insert(
            "ingestion_timestamp".to_string(),
            Value::String(timestamp(self.ingested_at)),
        );
        document.insert("etl_version".to_string(), Value::String(ETL_VERSION.to_string()));
        document.insert("source_api".to_string(), Value::String(self.source_api.clone()));
        document.insert("raw_data".to_string(), self.raw_data.clone());
        Value::Object(document)
    }
}

/// Records and per-item failures produced from one batch
#[derive(Debug, Default)]
pub struct Transformed {
    pub records: Vec<NormalizedRecord>,
    pub errors: Vec<ItemError>,
}

impl Transformed {
    pub(crate) fn push(&mut self, key: Option<&str>, result: Result<NormalizedRecord, TransformError>) {
        match result {
            Ok(record) => self.records.push(record),
            Err(e) => {
                tracing::warn!(key = key.unwrap_or("-"), error = %e, "Item transform failed");
                self.errors
                    .push(ItemError::new(ErrorStage::Transform, key.map(str::to_string), e));
            },
        }
    }
}

pub trait Transformer: Send + Sync {
    fn transform(&self, batch: &RawBatch) -> Transformed;
}

/// ISO-8601 UTC timestamp with millisecond precision
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Identity of a time-scoped record: `{tag}[_{key}]_{run timestamp}`
pub fn run_scoped_id(tag: &str, key: Option<&str>, run_started_at: DateTime<Utc>) -> String {
    match key {
        Some(key) => format!("{tag}_{key}_{}", timestamp(run_started_at)),
        None => format!("{tag}_{}", timestamp(run_started_at)),
    }
}

/// Identity of a record keyed only by the upstream's own id
pub fn entity_id(tag: &str, key: &str) -> String {
    format!("{tag}_{key}")
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub(crate) fn to_fields<T: Serialize>(value: &T) -> Result<Map<String, Value>, TransformError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(TransformError::Shape(format!("expected an object, got {other}"))),
    }
}
