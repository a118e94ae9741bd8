//! Normalizer for NVD CVE API 2.0 pages
//!
//! Each page carries a `vulnerabilities` array; every entry becomes one
//! record keyed by its CVE id, so re-ingesting a CVE replaces it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{entity_id, to_fields, NormalizedRecord, Transformed, Transformer};
use crate::error::TransformError;
use crate::extract::RawBatch;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Page {
    vulnerabilities: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VulnerabilityItem {
    cve: Cve,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Cve {
    id: String,
    source_identifier: String,
    published: String,
    last_modified: String,
    vuln_status: String,
    descriptions: Vec<LangString>,
    metrics: Metrics,
    weaknesses: Vec<Weakness>,
    references: Vec<Reference>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LangString {
    lang: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Metrics {
    #[serde(rename = "cvssMetricV40")]
    v40: Vec<Metric>,
    #[serde(rename = "cvssMetricV31")]
    v31: Vec<Metric>,
    #[serde(rename = "cvssMetricV30")]
    v30: Vec<Metric>,
    #[serde(rename = "cvssMetricV2")]
    v2: Vec<Metric>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Metric {
    cvss_data: CvssData,
    /// v2 reports severity next to the data rather than inside it
    base_severity: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CvssData {
    version: String,
    base_score: f64,
    base_severity: Option<String>,
    vector_string: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Weakness {
    description: Vec<LangString>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Reference {
    url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvssMetric {
    pub version: String,
    pub base_score: f64,
    pub base_severity: String,
    pub vector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CveRecord {
    pub cve_id: String,
    pub source_identifier: String,
    pub published: String,
    pub last_modified: String,
    pub vuln_status: String,
    pub description: String,
    pub cvss_metrics: Vec<CvssMetric>,
    pub cwe_ids: Vec<String>,
    pub references: Vec<String>,
}

impl From<Cve> for CveRecord {
    fn from(cve: Cve) -> Self {
        let description = cve
            .descriptions
            .iter()
            .find(|d| d.lang == "en")
            .or_else(|| cve.descriptions.first())
            .map(|d| d.value.clone())
            .unwrap_or_default();

        let Metrics { v40, v31, v30, v2 } = cve.metrics;
        let cvss_metrics = v40
            .into_iter()
            .chain(v31)
            .chain(v30)
            .chain(v2)
            .map(|m| CvssMetric {
                base_severity: m
                    .cvss_data
                    .base_severity
                    .or(m.base_severity)
                    .unwrap_or_default(),
                version: m.cvss_data.version,
                base_score: m.cvss_data.base_score,
                vector: m.cvss_data.vector_string,
            })
            .collect();

        let mut cwe_ids: Vec<String> = Vec::new();
        for description in cve.weaknesses.into_iter().flat_map(|w| w.description) {
            if !description.value.is_empty() && !cwe_ids.contains(&description.value) {
                cwe_ids.push(description.value);
            }
        }

        Self {
            cve_id: cve.id,
            source_identifier: cve.source_identifier,
            published: cve.published,
            last_modified: cve.last_modified,
            vuln_status: cve.vuln_status,
            description,
            cvss_metrics,
            cwe_ids,
            references: cve.references.into_iter().map(|r| r.url).collect(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CveTransformer;

impl CveTransformer {
    fn record(&self, batch: &RawBatch, item: Value) -> Result<NormalizedRecord, TransformError> {
        let parsed: VulnerabilityItem = serde_json::from_value(item.clone())?;
        if parsed.cve.id.is_empty() {
            return Err(TransformError::Shape("vulnerability without a CVE id".to_string()));
        }

        let record = CveRecord::from(parsed.cve);
        let id = entity_id(&batch.source.tag, &record.cve_id);
        Ok(NormalizedRecord::new(batch, id, to_fields(&record)?, item))
    }
}

impl Transformer for CveTransformer {
    fn transform(&self, batch: &RawBatch) -> Transformed {
        let mut out = Transformed::default();

        for payload in &batch.payloads {
            let page = payload
                .json()
                .and_then(|value| serde_json::from_value::<Page>(value).map_err(TransformError::from));
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    out.push(payload.key.as_deref(), Err(e));
                    continue;
                },
            };

            for (index, item) in page.vulnerabilities.into_iter().enumerate() {
                let key = format!("{}#{index}", payload.key.as_deref().unwrap_or("page"));
                out.push(Some(&key), self.record(batch, item));
            }
        }

        out
    }
}
