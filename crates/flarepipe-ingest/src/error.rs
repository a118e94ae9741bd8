//! Error types for the ingestion pipeline
//!
//! Errors are layered the same way the pipeline is:
//!
//! - [`TransportError`] / [`AttemptError`]: one HTTP call, classified by the retry policy
//! - [`FetchError`]: what the retry policy gives up with
//! - [`TransformError`]: a payload that does not fit its schema
//! - [`StoreError`] / [`LoadError`]: document store failures
//! - [`ConfigError`]: invalid static configuration
//!
//! Per-item failures that a run records instead of propagating are kept as
//! [`ItemError`] values in the source report.

use serde::Serialize;
use thiserror::Error;

/// Failure of the HTTP transport itself (no status code was received)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Timeouts and network-level failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Request(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            TransportError::Timeout(message)
        } else if err.is_connect() {
            TransportError::Connect(message)
        } else if err.is_builder() {
            TransportError::InvalidRequest(message)
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(message)
        } else {
            TransportError::Request(message)
        }
    }
}

/// Classified failure of a single attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),
}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        if err.is_retryable() {
            AttemptError::Retryable(err.to_string())
        } else {
            AttemptError::Fatal(err.to_string())
        }
    }
}

/// Terminal outcome of a retried operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("fatal error on attempt {attempt}: {error}")]
    Fatal { attempt: u32, error: String },
}

/// A raw payload that could not be normalized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("unexpected payload shape: {0}")]
    Shape(String),
}

impl From<serde_json::Error> for TransformError {
    fn from(err: serde_json::Error) -> Self {
        TransformError::InvalidJson(err.to_string())
    }
}

/// Document store failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("document store rejected the operation: {0}")]
    Rejected(String),

    #[error("schema migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    /// Whether a fresh connection might make the operation succeed
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Migrate(e) => StoreError::Migration(e.to_string()),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(err.to_string())
    }
}

/// A record that could not be written
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to load {id} into {collection}: {source}")]
pub struct LoadError {
    pub collection: String,
    pub id: String,
    #[source]
    pub source: StoreError,
}

/// Invalid static configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] flarepipe_common::CommonError),

    #[error("Configuration error: {0}")]
    Invalid(String),
}

/// Pipeline stage an item-level error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Extract,
    Transform,
    Load,
}

impl std::fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorStage::Extract => write!(f, "extract"),
            ErrorStage::Transform => write!(f, "transform"),
            ErrorStage::Load => write!(f, "load"),
        }
    }
}

/// A recorded per-item failure that did not abort its batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub stage: ErrorStage,
    /// Logical key of the failed item (domain, page offset, sample number)
    pub key: Option<String>,
    pub message: String,
}

impl ItemError {
    pub fn new(stage: ErrorStage, key: Option<String>, message: impl std::fmt::Display) -> Self {
        Self {
            stage,
            key,
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "[{}] {}: {}", self.stage, key, self.message),
            None => write!(f, "[{}] {}", self.stage, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_retryability() {
        assert!(TransportError::Timeout("10s".into()).is_retryable());
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(!TransportError::InvalidRequest("bad url".into()).is_retryable());
        assert!(!TransportError::Body("truncated".into()).is_retryable());
    }

    #[test]
    fn test_attempt_error_from_transport() {
        let err: AttemptError = TransportError::Timeout("slow".into()).into();
        assert!(matches!(err, AttemptError::Retryable(_)));

        let err: AttemptError = TransportError::InvalidRequest("nope".into()).into();
        assert!(matches!(err, AttemptError::Fatal(_)));
    }

    #[test]
    fn test_store_error_connection_classification() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_connection_error());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_connection_error());
    }

    #[test]
    fn test_item_error_display() {
        let err = ItemError::new(ErrorStage::Extract, Some("github.com".into()), "HTTP 404");
        assert_eq!(err.to_string(), "[extract] github.com: HTTP 404");

        let err = ItemError::new(ErrorStage::Load, None, "store down");
        assert_eq!(err.to_string(), "[load] store down");
    }
}
