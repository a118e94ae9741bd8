//! Aggregates repeated download samples into one speed-test record

use serde::Serialize;
use serde_json::{json, Value};

use super::{round_to, run_scoped_id, timestamp, to_fields, NormalizedRecord, Transformed, Transformer};
use crate::extract::{RawBatch, RawPayload};

/// Floor for elapsed time so a zero-length measurement cannot divide by zero
const MIN_ELAPSED_SECS: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedSample {
    pub iteration: u32,
    pub timestamp: String,
    pub data_size_bytes: u64,
    pub elapsed_time_seconds: f64,
    pub speed_mbps: f64,
    pub status_code: u16,
}

impl SpeedSample {
    pub fn from_payload(index: usize, payload: &RawPayload) -> Self {
        let iteration = payload
            .key
            .as_deref()
            .and_then(|key| key.parse().ok())
            .unwrap_or(index as u32 + 1);
        let data_size_bytes = payload.body.len() as u64;
        let elapsed = payload.elapsed.as_secs_f64().max(MIN_ELAPSED_SECS);
        let speed_mbps = (data_size_bytes as f64 * 8.0) / (elapsed * 1_000_000.0);

        Self {
            iteration,
            timestamp: timestamp(payload.fetched_at),
            data_size_bytes,
            elapsed_time_seconds: round_to(elapsed, 6),
            speed_mbps: round_to(speed_mbps, 2),
            status_code: payload.status,
        }
    }
}

/// Summary statistics over a non-empty sample set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population variance (divides by `count`)
    pub variance: f64,
}

impl Stats {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            count,
            mean,
            min,
            max,
            variance,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedSummary {
    pub test_count: usize,
    pub requested_count: usize,
    pub failed_count: usize,
    pub average_speed_mbps: Option<f64>,
    pub min_speed_mbps: Option<f64>,
    pub max_speed_mbps: Option<f64>,
    pub speed_variance: Option<f64>,
    pub individual_tests: Vec<SpeedSample>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpeedTransformer;

impl SpeedTransformer {
    pub fn summarize(batch: &RawBatch) -> SpeedSummary {
        let samples: Vec<SpeedSample> = batch
            .payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| SpeedSample::from_payload(index, payload))
            .collect();
        let speeds: Vec<f64> = samples.iter().map(|s| s.speed_mbps).collect();
        let stats = Stats::of(&speeds);

        SpeedSummary {
            test_count: samples.len(),
            requested_count: batch.attempted,
            failed_count: batch.attempted.saturating_sub(samples.len()),
            average_speed_mbps: stats.map(|s| round_to(s.mean, 2)),
            min_speed_mbps: stats.map(|s| round_to(s.min, 2)),
            max_speed_mbps: stats.map(|s| round_to(s.max, 2)),
            speed_variance: stats.map(|s| round_to(s.variance, 2)),
            individual_tests: samples,
        }
    }
}

impl Transformer for SpeedTransformer {
    /// Always produces exactly one record, empty when no sample succeeded
    fn transform(&self, batch: &RawBatch) -> Transformed {
        let mut out = Transformed::default();
        let summary = Self::summarize(batch);
        let raw_data: Value = json!({
            "samples": summary.individual_tests,
            "errors": batch.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        });

        let record = to_fields(&summary).map(|fields| {
            let id = run_scoped_id(&batch.source.tag, None, batch.run_started_at);
            NormalizedRecord::new(batch, id, fields, raw_data)
        });
        out.push(None, record);
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{ErrorStage, ItemError};
    use crate::source::{RawFormat, Source};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn payload(iteration: u32, bytes: usize, elapsed: Duration) -> RawPayload {
        RawPayload {
            key: Some(iteration.to_string()),
            status: 200,
            body: vec![0u8; bytes],
            elapsed,
            fetched_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, iteration).unwrap(),
        }
    }

    fn batch(payloads: Vec<RawPayload>, attempted: usize) -> RawBatch {
        let source = Source::new("speed", "Cloudflare Speed Test", "http://s", RawFormat::Binary);
        let mut batch = RawBatch::new(source, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        batch.payloads = payloads;
        batch.attempted = attempted;
        batch
    }

    #[test]
    fn test_population_variance() {
        let stats = Stats::of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.count, 8);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.variance, 4.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert!(Stats::of(&[]).is_none());
    }

    #[test]
    fn test_sample_speed() {
        // 1_000_000 bytes in 0.5s = 16 Mbps
        let sample = SpeedSample::from_payload(0, &payload(1, 1_000_000, Duration::from_millis(500)));
        assert_eq!(sample.iteration, 1);
        assert_eq!(sample.data_size_bytes, 1_000_000);
        assert_eq!(sample.elapsed_time_seconds, 0.5);
        assert_eq!(sample.speed_mbps, 16.0);
        assert_eq!(sample.status_code, 200);
    }

    #[test]
    fn test_zero_elapsed_is_floored() {
        let sample = SpeedSample::from_payload(0, &payload(1, 10, Duration::ZERO));
        assert_eq!(sample.elapsed_time_seconds, 0.000001);
        assert!(sample.speed_mbps.is_finite());
    }

    #[test]
    fn test_partial_failure_counts_successes_only() {
        let payloads = vec![
            payload(1, 1_000_000, Duration::from_secs(1)),
            payload(2, 1_000_000, Duration::from_secs(1)),
            payload(4, 2_000_000, Duration::from_secs(1)),
            payload(5, 2_000_000, Duration::from_secs(1)),
        ];
        let mut batch = batch(payloads, 5);
        batch
            .errors
            .push(ItemError::new(ErrorStage::Extract, Some("3".into()), "HTTP 404"));

        let out = SpeedTransformer.transform(&batch);

        assert_eq!(out.records.len(), 1);
        let fields = &out.records[0].fields;
        assert_eq!(fields["test_count"], 4);
        assert_eq!(fields["requested_count"], 5);
        assert_eq!(fields["failed_count"], 1);
        assert_eq!(fields["average_speed_mbps"], 12.0);
        assert_eq!(fields["min_speed_mbps"], 8.0);
        assert_eq!(fields["max_speed_mbps"], 16.0);
        assert_eq!(fields["speed_variance"], 16.0);
        assert_eq!(fields["individual_tests"].as_array().unwrap().len(), 4);
        assert_eq!(out.records[0].id, "speed_2024-05-01T12:00:00.000Z");
    }

    #[test]
    fn test_no_samples_yields_empty_aggregate() {
        let out = SpeedTransformer.transform(&batch(vec![], 3));

        assert_eq!(out.records.len(), 1);
        let fields = &out.records[0].fields;
        assert_eq!(fields["test_count"], 0);
        assert_eq!(fields["failed_count"], 3);
        assert!(fields["average_speed_mbps"].is_null());
        assert_eq!(fields["individual_tests"], serde_json::json!([]));
    }
}
