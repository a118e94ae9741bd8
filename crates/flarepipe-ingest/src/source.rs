//! Descriptors for the upstream APIs a run pulls from

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// Wire format of a source's response bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RawFormat {
    /// `key=value` lines
    TextKv,
    Json,
    /// Opaque bytes; only size and timing matter
    Binary,
}

/// Offset/limit paging over a JSON collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetPagination {
    /// Query parameter carrying the start offset
    pub offset_param: String,
    /// Query parameter carrying the page size
    pub limit_param: String,
    pub page_size: u64,
    /// Hard cap on pages fetched per query
    pub max_pages: u32,
    /// Dotted path to the item array in each page
    pub items_path: String,
    /// Dotted path to the total item count, when the API reports one
    pub total_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    None,
    Offset(OffsetPagination),
}

/// One upstream API
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// Short machine name, used in identities, logs and rate gating
    pub tag: String,
    /// Human-readable name, stamped on every stored document
    pub name: String,
    pub endpoint: String,
    pub format: RawFormat,
    pub pagination: Pagination,
    /// Target collection in the document store
    pub collection: String,
    /// Query parameters sent with every request
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub rate_interval: Duration,
}

impl Source {
    pub fn new(
        tag: impl Into<String>,
        name: impl Into<String>,
        endpoint: impl Into<String>,
        format: RawFormat,
    ) -> Self {
        let tag = tag.into();
        Self {
            collection: format!("{tag}_raw"),
            tag,
            name: name.into(),
            endpoint: endpoint.into(),
            format,
            pagination: Pagination::None,
            params: Vec::new(),
            headers: Vec::new(),
            rate_interval: Duration::ZERO,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_rate_interval(mut self, interval: Duration) -> Self {
        self.rate_interval = interval;
        self
    }

    pub fn with_pagination(mut self, pagination: OffsetPagination) -> Self {
        self.pagination = Pagination::Offset(pagination);
        self
    }

    pub fn is_paginated(&self) -> bool {
        matches!(self.pagination, Pagination::Offset(_))
    }
}

/// Follow a dotted path (`"a.b.c"`) through nested JSON objects
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}
