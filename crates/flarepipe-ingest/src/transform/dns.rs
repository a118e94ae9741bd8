//! Normalizer for DNS-over-HTTPS JSON responses (`application/dns-json`)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{run_scoped_id, to_fields, NormalizedRecord, Transformed, Transformer};
use crate::error::TransformError;
use crate::extract::{RawBatch, RawPayload};

/// DNS RCODE, rendered by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Unknown,
}

impl From<i64> for ResponseCode {
    fn from(code: i64) -> Self {
        match code {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormErr,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImp,
            5 => ResponseCode::Refused,
            _ => ResponseCode::Unknown,
        }
    }
}

fn default_status() -> i64 {
    -1
}

fn default_query_type() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status", default = "default_status")]
    status: i64,
    #[serde(rename = "TC", default)]
    truncated: bool,
    #[serde(rename = "RD", default)]
    recursion_desired: bool,
    #[serde(rename = "RA", default)]
    recursion_available: bool,
    #[serde(rename = "AD", default)]
    authenticated_data: bool,
    #[serde(rename = "Question", default)]
    question: Vec<DohQuestion>,
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohQuestion {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default = "default_query_type")]
    record_type: u16,
}

/// One answer record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub record_type: u16,
    #[serde(rename(deserialize = "TTL"), default)]
    pub ttl: u32,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    pub query_name: String,
    pub query_type: u16,
    pub status: i64,
    pub response_code: ResponseCode,
    pub answers: Vec<DnsAnswer>,
    pub answer_count: usize,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub authenticated_data: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DnsTransformer;

impl DnsTransformer {
    fn record(&self, batch: &RawBatch, payload: &RawPayload) -> Result<NormalizedRecord, TransformError> {
        let mut raw = payload.json()?;
        let response: DohResponse = serde_json::from_value(raw.clone())?;

        let first_question = response.question.first();
        let query_name = payload
            .key
            .clone()
            .or_else(|| first_question.map(|q| q.name.trim_end_matches('.').to_string()))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let record = DnsRecord {
            query_type: first_question.map_or(default_query_type(), |q| q.record_type),
            status: response.status,
            response_code: ResponseCode::from(response.status),
            answer_count: response.answer.len(),
            answers: response.answer,
            truncated: response.truncated,
            recursion_desired: response.recursion_desired,
            recursion_available: response.recursion_available,
            authenticated_data: response.authenticated_data,
            query_name,
        };

        if let Value::Object(map) = &mut raw {
            map.insert("queried_domain".to_string(), Value::String(record.query_name.clone()));
        }

        let id = run_scoped_id(&batch.source.tag, Some(&record.query_name), batch.run_started_at);
        Ok(NormalizedRecord::new(batch, id, to_fields(&record)?, raw))
    }
}

impl Transformer for DnsTransformer {
    fn transform(&self, batch: &RawBatch) -> Transformed {
        let mut out = Transformed::default();
        for payload in &batch.payloads {
            out.push(payload.key.as_deref(), self.record(batch, payload));
        }
        out
    }
}
