//! Run orchestration
//!
//! Sources run one after another. Each goes through
//! `idle -> extracting -> transforming -> loading -> idle`, and whatever it
//! produced is tallied into a [`SourceReport`]. A failing source never stops
//! the ones after it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ErrorStage, ItemError};
use crate::extract::{ExtractPlan, Extractor, RawBatch};
use crate::http::HttpClient;
use crate::loader::Loader;
use crate::rate_gate::RateGate;
use crate::retry::RetryPolicy;
use crate::source::Source;
use crate::store::UpsertOutcome;
use crate::transform::Transformer;

/// A source together with how to walk it and how to normalize what comes back
pub struct SourcePipeline {
    pub source: Source,
    pub plan: ExtractPlan,
    pub transformer: Box<dyn Transformer>,
    pub enabled: bool,
}

impl SourcePipeline {
    pub fn new(source: Source, plan: ExtractPlan, transformer: impl Transformer + 'static) -> Self {
        Self {
            source,
            plan,
            transformer: Box::new(transformer),
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Extracting,
    Transforming,
    Loading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Every item made it into the store
    Succeeded,
    /// Some records loaded, some items failed
    Partial,
    /// Nothing usable came out of the source
    Failed,
    /// Disabled in configuration
    Skipped,
    /// Not started because the run was cancelled
    Cancelled,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceStatus::Succeeded => "succeeded",
            SourceStatus::Partial => "partial",
            SourceStatus::Failed => "failed",
            SourceStatus::Skipped => "skipped",
            SourceStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Per-source tally of a run
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub collection: String,
    pub status: SourceStatus,
    /// Items the extract plan called for
    pub attempted: usize,
    pub extracted: usize,
    pub transformed: usize,
    pub loaded: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub errors: Vec<ItemError>,
    pub duration_ms: u64,
}

impl SourceReport {
    fn new(source: &Source, status: SourceStatus) -> Self {
        Self {
            source: source.tag.clone(),
            collection: source.collection.clone(),
            status,
            attempted: 0,
            extracted: 0,
            transformed: 0,
            loaded: 0,
            inserted: 0,
            replaced: 0,
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    fn record_extraction(&mut self, batch: &RawBatch) {
        self.attempted = batch.attempted;
        self.extracted = batch.item_count();
        self.errors.extend(batch.errors.iter().cloned());
    }

    fn classify(&self, batch: &RawBatch) -> SourceStatus {
        let transform_failed = self.transformed == 0
            && self.errors.iter().any(|e| e.stage == ErrorStage::Transform);

        if batch.is_wholly_failed() || transform_failed || (self.transformed > 0 && self.loaded == 0)
        {
            SourceStatus::Failed
        } else if self.errors.is_empty() {
            SourceStatus::Succeeded
        } else {
            SourceStatus::Partial
        }
    }

    /// Produced at least one usable result
    pub fn succeeded(&self) -> bool {
        matches!(self.status, SourceStatus::Succeeded | SourceStatus::Partial)
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub sources: Vec<SourceReport>,
    /// Documents per touched collection after the run
    pub collection_counts: BTreeMap<String, u64>,
}

impl PipelineResult {
    /// No source failed at batch level and none was cancelled
    pub fn success(&self) -> bool {
        self.sources
            .iter()
            .all(|s| !matches!(s.status, SourceStatus::Failed | SourceStatus::Cancelled))
    }

    pub fn any_succeeded(&self) -> bool {
        self.sources.iter().any(SourceReport::succeeded)
    }

    pub fn source(&self, tag: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source == tag)
    }

    pub fn records_per_source(&self) -> BTreeMap<String, usize> {
        self.sources
            .iter()
            .map(|s| (s.source.clone(), s.loaded))
            .collect()
    }

    pub fn total_loaded(&self) -> usize {
        self.sources.iter().map(|s| s.loaded).sum()
    }

    pub fn error_count(&self) -> usize {
        self.sources.iter().map(|s| s.errors.len()).sum()
    }

    pub fn log_summary(&self) {
        for report in &self.sources {
            match report.status {
                SourceStatus::Succeeded | SourceStatus::Partial => info!(
                    source = %report.source,
                    status = %report.status,
                    extracted = report.extracted,
                    loaded = report.loaded,
                    inserted = report.inserted,
                    replaced = report.replaced,
                    errors = report.errors.len(),
                    duration_ms = report.duration_ms,
                    "✓ Source finished"
                ),
                SourceStatus::Failed => error!(
                    source = %report.source,
                    attempted = report.attempted,
                    errors = report.errors.len(),
                    first_error = %report.errors.first().map(|e| e.to_string()).unwrap_or_default(),
                    "✗ Source failed"
                ),
                SourceStatus::Skipped | SourceStatus::Cancelled => {
                    info!(source = %report.source, status = %report.status, "Source not run")
                },
            }
        }
        for (collection, count) in &self.collection_counts {
            info!(collection = %collection, documents = count, "Collection size");
        }
        info!(
            run_id = %self.run_id,
            success = self.success(),
            loaded = self.total_loaded(),
            errors = self.error_count(),
            duration_secs = self.duration_secs,
            "Pipeline run completed"
        );
    }
}

pub struct Orchestrator {
    http: Arc<dyn HttpClient>,
    retry: RetryPolicy,
    gate: RateGate,
    request_timeout: Duration,
    pipelines: Vec<SourcePipeline>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: &PipelineConfig,
        http: Arc<dyn HttpClient>,
        pipelines: Vec<SourcePipeline>,
    ) -> Self {
        let gate = pipelines.iter().fold(RateGate::new(), |gate, p| {
            gate.with_interval(p.source.tag.clone(), p.source.rate_interval)
        });

        Self {
            http,
            retry: RetryPolicy::new(config.http.retry_attempts, config.retry_delay()),
            gate,
            request_timeout: config.request_timeout(),
            pipelines,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop before the next source once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn pipelines(&self) -> &[SourcePipeline] {
        &self.pipelines
    }

    fn extractor(&self) -> Extractor<'_> {
        Extractor::new(self.http.as_ref(), &self.retry, &self.gate, self.request_timeout)
    }

    /// Run every pipeline once
    pub async fn run(&self, loader: &mut Loader) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%run_id, sources = self.pipelines.len(), "Starting pipeline run");

        let mut sources = Vec::with_capacity(self.pipelines.len());
        for pipeline in &self.pipelines {
            if !pipeline.enabled {
                sources.push(SourceReport::new(&pipeline.source, SourceStatus::Skipped));
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!(source = %pipeline.source.tag, "Run cancelled, not starting source");
                sources.push(SourceReport::new(&pipeline.source, SourceStatus::Cancelled));
                continue;
            }
            sources.push(self.run_source(pipeline, loader, started_at).await);
        }

        let mut collection_counts = BTreeMap::new();
        for report in sources.iter().filter(|r| r.loaded > 0) {
            if collection_counts.contains_key(&report.collection) {
                continue;
            }
            match loader.count(&report.collection, &json!({})).await {
                Ok(count) => {
                    collection_counts.insert(report.collection.clone(), count);
                },
                Err(e) => warn!(collection = %report.collection, error = %e, "Failed to count documents"),
            }
        }

        let result = PipelineResult {
            run_id,
            started_at,
            completed_at: Utc::now(),
            duration_secs: clock.elapsed().as_secs_f64(),
            sources,
            collection_counts,
        };
        result.log_summary();
        result
    }

    #[instrument(skip_all, fields(source = %pipeline.source.tag))]
    async fn run_source(
        &self,
        pipeline: &SourcePipeline,
        loader: &mut Loader,
        run_started_at: DateTime<Utc>,
    ) -> SourceReport {
        let clock = Instant::now();
        let mut report = SourceReport::new(&pipeline.source, SourceStatus::Failed);
        let enter = |state: SourceState| debug!(state = ?state, "Source state");

        enter(SourceState::Extracting);
        let batch = self
            .extractor()
            .extract(&pipeline.source, &pipeline.plan, run_started_at)
            .await;
        report.record_extraction(&batch);

        if batch.is_wholly_failed() {
            enter(SourceState::Idle);
            report.status = SourceStatus::Failed;
            report.duration_ms = clock.elapsed().as_millis() as u64;
            return report;
        }

        enter(SourceState::Transforming);
        let transformed = pipeline.transformer.transform(&batch);
        report.transformed = transformed.records.len();
        report.errors.extend(transformed.errors);

        enter(SourceState::Loading);
        for record in &transformed.records {
            match loader.upsert(record).await {
                Ok(outcome) => {
                    report.loaded += 1;
                    match outcome {
                        UpsertOutcome::Inserted => report.inserted += 1,
                        UpsertOutcome::Replaced => report.replaced += 1,
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Record load failed");
                    report
                        .errors
                        .push(ItemError::new(ErrorStage::Load, Some(record.id.clone()), e));
                },
            }
        }

        enter(SourceState::Idle);
        report.status = report.classify(&batch);
        report.duration_ms = clock.elapsed().as_millis() as u64;
        report
    }

    /// Extract from every enabled source without transforming or loading
    pub async fn check(&self) -> Vec<SourceReport> {
        let run_started_at = Utc::now();
        let mut reports = Vec::new();

        for pipeline in self.pipelines.iter().filter(|p| p.enabled) {
            let clock = Instant::now();
            let batch = self
                .extractor()
                .extract(&pipeline.source, &pipeline.plan, run_started_at)
                .await;

            let mut report = SourceReport::new(&pipeline.source, SourceStatus::Succeeded);
            report.record_extraction(&batch);
            report.status = if batch.is_wholly_failed() {
                SourceStatus::Failed
            } else if report.errors.is_empty() {
                SourceStatus::Succeeded
            } else {
                SourceStatus::Partial
            };
            report.duration_ms = clock.elapsed().as_millis() as u64;
            reports.push(report);
        }

        reports
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::extract::tests::ScriptedClient;
    use crate::loader::tests::FlakyConnector;
    use crate::source::RawFormat;
    use crate::store::MemoryStore;
    use crate::transform::{SpeedTransformer, TraceTransformer};

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.http.retry_attempts = 1;
        config
    }

    fn trace() -> SourcePipeline {
        SourcePipeline::new(
            Source::new("trace", "Cloudflare Trace", "http://trace.test", RawFormat::TextKv),
            ExtractPlan::Single,
            TraceTransformer,
        )
    }

    fn speed(iterations: u32) -> SourcePipeline {
        SourcePipeline::new(
            Source::new("speed", "Cloudflare Speed Test", "http://speed.test", RawFormat::Binary),
            ExtractPlan::Repeated { iterations },
            SpeedTransformer,
        )
    }

    #[tokio::test]
    async fn test_failed_source_does_not_stop_others() {
        // trace gets a 404, speed gets two good samples
        let client = Arc::new(ScriptedClient::new([
            ScriptedClient::ok(404, ""),
            ScriptedClient::ok(200, "xxxx"),
            ScriptedClient::ok(200, "yyyy"),
        ]));
        let store = MemoryStore::new();
        let mut loader = Loader::connect(Arc::new(store.clone())).await.unwrap();
        let orchestrator = Orchestrator::new(&config(), client, vec![trace(), speed(2)]);

        let result = orchestrator.run(&mut loader).await;

        assert_eq!(result.source("trace").unwrap().status, SourceStatus::Failed);
        let speed = result.source("speed").unwrap();
        assert_eq!(speed.status, SourceStatus::Succeeded);
        assert_eq!(speed.loaded, 1);
        assert!(!result.success());
        assert!(result.any_succeeded());
        assert_eq!(result.collection_counts.get("speed_raw"), Some(&1));
        assert_eq!(store.len("speed_raw"), 1);
    }

    #[tokio::test]
    async fn test_wholly_failed_batch_loads_nothing() {
        let client = Arc::new(ScriptedClient::new([
            ScriptedClient::ok(404, ""),
            ScriptedClient::ok(404, ""),
            ScriptedClient::ok(404, ""),
        ]));
        let store = MemoryStore::new();
        let mut loader = Loader::connect(Arc::new(store.clone())).await.unwrap();
        let orchestrator = Orchestrator::new(&config(), client, vec![speed(3)]);

        let result = orchestrator.run(&mut loader).await;

        let report = result.source("speed").unwrap();
        assert_eq!(report.status, SourceStatus::Failed);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.transformed, 0);
        assert_eq!(report.loaded, 0);
        assert_eq!(report.errors.len(), 3);
        assert!(store.is_empty());
        assert!(result.collection_counts.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_source_is_skipped() {
        let client = Arc::new(ScriptedClient::new([ScriptedClient::ok(200, "colo=AMS")]));
        let mut loader = Loader::connect(Arc::new(MemoryStore::new())).await.unwrap();
        let orchestrator =
            Orchestrator::new(&config(), client.clone(), vec![trace(), speed(3).enabled(false)]);

        let result = orchestrator.run(&mut loader).await;

        assert_eq!(result.source("speed").unwrap().status, SourceStatus::Skipped);
        assert_eq!(result.source("trace").unwrap().status, SourceStatus::Succeeded);
        assert!(result.success());
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_remaining_sources() {
        let client = Arc::new(ScriptedClient::new([]));
        let mut loader = Loader::connect(Arc::new(MemoryStore::new())).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let orchestrator = Orchestrator::new(&config(), client.clone(), vec![trace(), speed(2)])
            .with_cancellation(token);

        let result = orchestrator.run(&mut loader).await;

        assert!(result
            .sources
            .iter()
            .all(|s| s.status == SourceStatus::Cancelled));
        assert!(!result.any_succeeded());
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_samples_make_partial_source() {
        let client = Arc::new(ScriptedClient::new([
            ScriptedClient::ok(200, "aa"),
            ScriptedClient::ok(400, ""),
            ScriptedClient::ok(200, "bb"),
        ]));
        let mut loader = Loader::connect(Arc::new(MemoryStore::new())).await.unwrap();
        let orchestrator = Orchestrator::new(&config(), client, vec![speed(3)]);

        let result = orchestrator.run(&mut loader).await;

        let report = result.source("speed").unwrap();
        assert_eq!(report.status, SourceStatus::Partial);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.extracted, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_all_loads_failing_marks_source_failed() {
        let client = Arc::new(ScriptedClient::new([ScriptedClient::ok(200, "colo=AMS")]));
        // every write and every reconnect attempt fails
        let connector = Arc::new(FlakyConnector::new(u32::MAX));
        let mut loader = Loader::connect(connector).await.unwrap();
        let orchestrator = Orchestrator::new(&config(), client, vec![trace()]);

        let result = orchestrator.run(&mut loader).await;

        let report = result.source("trace").unwrap();
        assert_eq!(report.status, SourceStatus::Failed);
        assert_eq!(report.transformed, 1);
        assert_eq!(report.loaded, 0);
        assert_eq!(report.errors[0].stage, ErrorStage::Load);
    }

    #[tokio::test]
    async fn test_check_extracts_without_loading() {
        let client = Arc::new(ScriptedClient::new([
            ScriptedClient::ok(200, "colo=AMS"),
            ScriptedClient::ok(200, "aa"),
        ]));
        let orchestrator = Orchestrator::new(&config(), client, vec![trace(), speed(1)]);

        let reports = orchestrator.check().await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == SourceStatus::Succeeded));
        assert!(reports.iter().all(|r| r.loaded == 0));
    }
}
