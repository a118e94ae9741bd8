//! flarepipe ingestion library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! An extract -> transform -> load pipeline for unreliable public HTTP APIs.
//!
//! # Stages
//!
//! - **Extract**: [`extract::Extractor`] walks a [`source::Source`] with a
//!   [`rate_gate::RateGate`] and a [`retry::RetryPolicy`] in front of every
//!   request
//! - **Transform**: a [`transform::Transformer`] per source normalizes raw
//!   payloads into [`transform::NormalizedRecord`]s with deterministic ids
//! - **Load**: [`loader::Loader`] upserts records into a
//!   [`store::DocumentStore`], replacing documents with the same id
//!
//! [`orchestrator::Orchestrator`] runs the sources one after another and
//! reports a [`orchestrator::PipelineResult`].
//!
//! # Supported Sources
//!
//! - **Cloudflare Trace**: `key=value` request metadata
//! - **Cloudflare DoH**: DNS-over-HTTPS JSON answers, one query per domain
//! - **Cloudflare Speed Test**: repeated download samples, aggregated
//! - **NVD CVE API**: offset-paginated CVE records over a last-modified window
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flarepipe_ingest::config::PipelineConfig;
//! use flarepipe_ingest::connectors::build_pipelines;
//! use flarepipe_ingest::http::ReqwestHttpClient;
//! use flarepipe_ingest::loader::Loader;
//! use flarepipe_ingest::orchestrator::Orchestrator;
//! use flarepipe_ingest::store::MemoryStore;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let http = Arc::new(ReqwestHttpClient::new(&config.http.user_agent)?);
//!     let pipelines = build_pipelines(&config, chrono::Utc::now());
//!
//!     let mut loader = Loader::connect(Arc::new(MemoryStore::new())).await?;
//!     let result = Orchestrator::new(&config, http, pipelines).run(&mut loader).await;
//!     println!("loaded {} records", result.total_loaded());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connectors;
pub mod error;
pub mod extract;
pub mod http;
pub mod loader;
pub mod orchestrator;
pub mod rate_gate;
pub mod retry;
pub mod source;
pub mod store;
pub mod transform;

pub use config::PipelineConfig;
pub use error::{ConfigError, FetchError, LoadError, StoreError, TransformError, TransportError};
pub use orchestrator::{Orchestrator, PipelineResult, SourcePipeline, SourceReport, SourceStatus};
