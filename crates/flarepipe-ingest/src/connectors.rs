//! Catalogue of the shipped source connectors

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::{DnsConfig, NvdConfig, PipelineConfig, SpeedConfig, TraceConfig};
use crate::extract::{ExtractPlan, Query};
use crate::orchestrator::SourcePipeline;
use crate::source::{OffsetPagination, RawFormat, Source};
use crate::transform::{CveTransformer, DnsTransformer, SpeedTransformer, TraceTransformer};

pub const TRACE_COLLECTION: &str = "cloudflare_trace_raw";
pub const DNS_COLLECTION: &str = "cloudflare_doh_raw";
pub const SPEED_COLLECTION: &str = "cloudflare_speed_raw";
pub const NVD_COLLECTION: &str = "nvd_cves_raw";

/// Every collection the shipped connectors write to
pub const COLLECTIONS: &[&str] = &[TRACE_COLLECTION, DNS_COLLECTION, SPEED_COLLECTION, NVD_COLLECTION];

/// Longest last-modified range the NVD API accepts in one query
pub const NVD_MAX_WINDOW_DAYS: i64 = 120;

pub fn trace_pipeline(config: &TraceConfig) -> SourcePipeline {
    let source = Source::new("trace", "Cloudflare Trace", &config.url, RawFormat::TextKv)
        .with_collection(TRACE_COLLECTION)
        .with_rate_interval(Duration::from_millis(config.rate_interval_ms));

    SourcePipeline::new(source, ExtractPlan::Single, TraceTransformer).enabled(config.enabled)
}

pub fn dns_pipeline(config: &DnsConfig) -> SourcePipeline {
    let source = Source::new("dns", "Cloudflare DoH", &config.url, RawFormat::Json)
        .with_collection(DNS_COLLECTION)
        .with_param("type", &config.record_type)
        .with_header("accept", "application/dns-json")
        .with_rate_interval(Duration::from_millis(config.rate_interval_ms));

    let queries = config
        .domains
        .iter()
        .map(|domain| Query::new(domain.as_str()).with_param("name", domain.as_str()))
        .collect();

    SourcePipeline::new(source, ExtractPlan::Queries(queries), DnsTransformer).enabled(config.enabled)
}

pub fn speed_pipeline(config: &SpeedConfig) -> SourcePipeline {
    let mut source = Source::new("speed", "Cloudflare Speed Test", &config.url, RawFormat::Binary)
        .with_collection(SPEED_COLLECTION)
        .with_rate_interval(Duration::from_millis(config.rate_interval_ms));
    if let Some(bytes) = config.download_bytes {
        source = source.with_param("bytes", bytes.to_string());
    }

    let plan = ExtractPlan::Repeated {
        iterations: config.iterations,
    };
    SourcePipeline::new(source, plan, SpeedTransformer).enabled(config.enabled)
}

fn nvd_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Split `[start, end)` into consecutive windows no longer than the API allows
pub fn nvd_windows(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let step = chrono::Duration::days(NVD_MAX_WINDOW_DAYS);
    let mut windows = Vec::new();
    let mut from = start;
    while from < end {
        let to = (from + step).min(end);
        windows.push((from, to));
        from = to;
    }
    windows
}

/// NVD CVE pipeline over the configured last-modified range
///
/// Without an explicit start, the range is the `lookback_hours` before its
/// end; without an explicit end, it ends at `now`.
pub fn nvd_pipeline(config: &NvdConfig, now: DateTime<Utc>) -> SourcePipeline {
    let mut source = Source::new("nvd", "NVD CVE API", &config.url, RawFormat::Json)
        .with_collection(NVD_COLLECTION)
        .with_rate_interval(Duration::from_millis(config.rate_interval_ms))
        .with_pagination(OffsetPagination {
            offset_param: "startIndex".to_string(),
            limit_param: "resultsPerPage".to_string(),
            page_size: config.page_size,
            max_pages: config.max_pages,
            items_path: "vulnerabilities".to_string(),
            total_path: Some("totalResults".to_string()),
        });
    if let Some(key) = &config.api_key {
        source = source.with_header("apiKey", key);
    }

    let end = config.last_mod_end.unwrap_or(now);
    let lookback = i64::try_from(config.lookback_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .unwrap_or(chrono::Duration::MAX);
    let start = config.last_mod_start.unwrap_or_else(|| {
        end.checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    });

    let queries = nvd_windows(start, end)
        .into_iter()
        .map(|(from, to)| {
            Query::new(from.format("%Y-%m-%d").to_string())
                .with_param("lastModStartDate", nvd_timestamp(from))
                .with_param("lastModEndDate", nvd_timestamp(to))
        })
        .collect();

    SourcePipeline::new(source, ExtractPlan::Queries(queries), CveTransformer).enabled(config.enabled)
}

/// Build every shipped pipeline, enabled or not, in run order
pub fn build_pipelines(config: &PipelineConfig, now: DateTime<Utc>) -> Vec<SourcePipeline> {
    vec![
        trace_pipeline(&config.trace),
        dns_pipeline(&config.dns),
        speed_pipeline(&config.speed),
        nvd_pipeline(&config.nvd, now),
    ]
}
