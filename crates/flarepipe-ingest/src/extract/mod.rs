//! Extraction stage
//!
//! An [`Extractor`] turns a [`Source`] plus an [`ExtractPlan`] into a
//! [`RawBatch`]. Every request goes through the rate gate and the retry
//! policy. A request that still fails is recorded as an item error and the
//! batch continues with the next item.

mod paginated;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ErrorStage, FetchError, ItemError, TransformError};
use crate::http::{HttpClient, HttpRequest};
use crate::rate_gate::RateGate;
use crate::retry::{check_status, RetryPolicy};
use crate::source::{Pagination, Source};

/// One logical request (or paged request series) within a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub key: Option<String>,
    pub params: Vec<(String, String)>,
}

impl Query {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }
}

/// How a source is walked during one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractPlan {
    /// One request (or one paged series for paginated sources)
    Single,
    /// The same request repeated, each response kept as its own sample
    Repeated { iterations: u32 },
    /// One request (or paged series) per query
    Queries(Vec<Query>),
}

/// A successful response
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    /// Logical key: queried domain, sample number, page offset
    pub key: Option<String>,
    pub status: u16,
    pub body: Vec<u8>,
    /// Wall-clock time of the successful attempt, request to last body byte
    pub elapsed: Duration,
    pub fetched_at: DateTime<Utc>,
}

impl RawPayload {
    pub fn text(&self) -> Result<&str, TransformError> {
        std::str::from_utf8(&self.body).map_err(|_| TransformError::NotUtf8)
    }

    pub fn json(&self) -> Result<Value, TransformError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Everything one source returned during one run
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub source: Source,
    /// Start of the whole run; identities of time-scoped records derive from it
    pub run_started_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub payloads: Vec<RawPayload>,
    pub errors: Vec<ItemError>,
    /// Number of requests (items) the plan called for
    pub attempted: usize,
}

impl RawBatch {
    pub fn new(source: Source, run_started_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            source,
            run_started_at,
            started_at: now,
            completed_at: now,
            payloads: Vec::new(),
            errors: Vec::new(),
            attempted: 0,
        }
    }

    pub fn item_count(&self) -> usize {
        self.payloads.len()
    }

    /// Every attempted item failed
    pub fn is_wholly_failed(&self) -> bool {
        self.attempted > 0 && self.payloads.is_empty()
    }

    fn record(&mut self, key: Option<String>, result: Result<RawPayload, FetchError>) -> bool {
        match result {
            Ok(payload) => {
                self.payloads.push(payload);
                true
            },
            Err(e) => {
                warn!(
                    source = %self.source.tag,
                    key = key.as_deref().unwrap_or("-"),
                    error = %e,
                    "Item extraction failed"
                );
                self.errors.push(ItemError::new(ErrorStage::Extract, key, e));
                false
            },
        }
    }
}

pub struct Extractor<'a> {
    http: &'a dyn HttpClient,
    retry: &'a RetryPolicy,
    gate: &'a RateGate,
    timeout: Duration,
}

impl<'a> Extractor<'a> {
    pub fn new(
        http: &'a dyn HttpClient,
        retry: &'a RetryPolicy,
        gate: &'a RateGate,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            retry,
            gate,
            timeout,
        }
    }

    pub async fn extract(
        &self,
        source: &Source,
        plan: &ExtractPlan,
        run_started_at: DateTime<Utc>,
    ) -> RawBatch {
        let mut batch = RawBatch::new(source.clone(), run_started_at);

        match plan {
            ExtractPlan::Single => {
                self.fetch_query(source, &Query::default(), &mut batch).await;
            },
            ExtractPlan::Repeated { iterations } => {
                for iteration in 1..=*iterations {
                    let key = Some(iteration.to_string());
                    batch.attempted += 1;
                    let result = self.fetch(source, &[], key.clone()).await;
                    batch.record(key, result);
                }
            },
            ExtractPlan::Queries(queries) => {
                for query in queries {
                    self.fetch_query(source, query, &mut batch).await;
                }
            },
        }

        batch.completed_at = Utc::now();
        info!(
            source = %source.tag,
            attempted = batch.attempted,
            extracted = batch.item_count(),
            failed = batch.errors.len(),
            "Extraction finished"
        );
        batch
    }

    async fn fetch_query(&self, source: &Source, query: &Query, batch: &mut RawBatch) {
        match &source.pagination {
            Pagination::None => {
                batch.attempted += 1;
                let result = self.fetch(source, &query.params, query.key.clone()).await;
                batch.record(query.key.clone(), result);
            },
            Pagination::Offset(paging) => {
                self.fetch_pages(source, paging, query, batch).await;
            },
        }
    }

    /// One gated, retried GET
    async fn fetch(
        &self,
        source: &Source,
        params: &[(String, String)],
        key: Option<String>,
    ) -> Result<RawPayload, FetchError> {
        let request = HttpRequest::get(&source.endpoint, self.timeout)
            .with_query(&source.params)
            .with_query(params)
            .with_headers(&source.headers);

        let http = self.http;
        let gate = self.gate;
        let request = &request;
        let tag = source.tag.as_str();

        let (response, elapsed) = self
            .retry
            .execute(tag, move || async move {
                gate.wait(tag).await;
                let started = std::time::Instant::now();
                let response = http.get(request).await?;
                let elapsed = started.elapsed();
                check_status(response.status)?;
                Ok((response, elapsed))
            })
            .await?;

        Ok(RawPayload {
            key,
            status: response.status,
            body: response.body,
            elapsed,
            fetched_at: Utc::now(),
        })
    }
}
