//! Key-value parser for `/cdn-cgi/trace` style responses
//!
//! The body is a list of `key=value` lines. Each line is split on the first
//! `=`; lines without one are ignored. Missing keys fall back to sentinels.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use super::{run_scoped_id, to_fields, NormalizedRecord, Transformed, Transformer};
use crate::error::TransformError;
use crate::extract::{RawBatch, RawPayload};

/// Parse `key=value` lines into a flat mapping
pub fn parse_kv(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Normalized trace fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceInfo {
    pub ip_address: String,
    pub timestamp: String,
    pub visit_scheme: String,
    pub user_agent: String,
    pub colo: String,
    pub http_version: String,
    pub location: String,
    pub tls_version: String,
    pub sni: String,
    pub warp: String,
    pub gateway: String,
}

impl TraceInfo {
    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Self {
        let get = |key: &str, sentinel: &str| {
            pairs
                .get(key)
                .cloned()
                .unwrap_or_else(|| sentinel.to_string())
        };

        Self {
            ip_address: get("ip", "unknown"),
            timestamp: get("ts", ""),
            visit_scheme: get("visit_scheme", ""),
            user_agent: get("uag", ""),
            colo: get("colo", ""),
            http_version: get("http", ""),
            location: get("loc", ""),
            tls_version: get("tls", ""),
            sni: get("sni", ""),
            warp: get("warp", "off"),
            gateway: get("gateway", "off"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TraceTransformer;

impl TraceTransformer {
    fn record(&self, batch: &RawBatch, payload: &RawPayload) -> Result<NormalizedRecord, TransformError> {
        let pairs = parse_kv(payload.text()?);
        let fields = to_fields(&TraceInfo::from_pairs(&pairs))?;
        let raw_data = Value::Object(
            pairs
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        );

        let id = run_scoped_id(&batch.source.tag, payload.key.as_deref(), batch.run_started_at);

        Ok(NormalizedRecord::new(batch, id, fields, raw_data))
    }
}

impl Transformer for TraceTransformer {
    fn transform(&self, batch: &RawBatch) -> Transformed {
        let mut out = Transformed::default();
        for payload in &batch.payloads {
            out.push(payload.key.as_deref(), self.record(batch, payload));
        }
        out
    }
}
