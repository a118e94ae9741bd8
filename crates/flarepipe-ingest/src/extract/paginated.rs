//! Offset/limit paging
//!
//! Pages are requested at offsets `0, n1, n1+n2, ...` where `n` is the
//! number of items each page actually returned. Paging stops on a page
//! shorter than requested, when the reported total is reached, or at
//! `max_pages`. A failed page advances the cursor by the requested page size
//! once a total is known; before that there is nothing to bound the walk, so
//! paging stops.

use tracing::{debug, warn};

use super::{Extractor, Query, RawBatch};
use crate::error::{ErrorStage, ItemError, TransformError};
use crate::source::{json_path, OffsetPagination, Source};

/// Items on a page and the total the API reported, if any
fn page_counts(body: &[u8], paging: &OffsetPagination) -> Result<(u64, Option<u64>), TransformError> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let items = json_path(&value, &paging.items_path)
        .and_then(|items| items.as_array())
        .ok_or_else(|| {
            TransformError::Shape(format!("no item array at '{}'", paging.items_path))
        })?;
    let total = paging
        .total_path
        .as_deref()
        .and_then(|path| json_path(&value, path))
        .and_then(|total| total.as_u64());

    Ok((items.len() as u64, total))
}

fn page_key(query: &Query, offset: u64) -> String {
    match &query.key {
        Some(key) => format!("{key}@{offset}"),
        None => offset.to_string(),
    }
}

impl Extractor<'_> {
    pub(super) async fn fetch_pages(
        &self,
        source: &Source,
        paging: &OffsetPagination,
        query: &Query,
        batch: &mut RawBatch,
    ) {
        let page_size = paging.page_size.max(1);
        let mut offset = 0u64;
        let mut total: Option<u64> = None;

        for page in 0..paging.max_pages {
            let key = page_key(query, offset);
            let mut params = query.params.clone();
            params.push((paging.offset_param.clone(), offset.to_string()));
            params.push((paging.limit_param.clone(), page_size.to_string()));

            batch.attempted += 1;
            let result = self.fetch(source, &params, Some(key.clone())).await;

            let received = match result {
                Ok(payload) => match page_counts(&payload.body, paging) {
                    Ok((received, reported_total)) => {
                        total = reported_total.or(total);
                        batch.payloads.push(payload);
                        Some(received)
                    },
                    Err(e) => {
                        warn!(source = %source.tag, key = %key, error = %e, "Unreadable page");
                        batch.errors.push(ItemError::new(ErrorStage::Extract, Some(key), e));
                        None
                    },
                },
                Err(e) => {
                    batch.record(Some(key), Err(e));
                    None
                },
            };

            debug!(
                source = %source.tag,
                page = page + 1,
                offset,
                received = ?received,
                total = ?total,
                "Fetched page"
            );

            match received {
                Some(n) if n < page_size => return,
                Some(n) => offset += n,
                None if total.is_none() => {
                    warn!(
                        source = %source.tag,
                        offset,
                        "No total reported yet, stopping after failed page"
                    );
                    return;
                },
                None => offset += page_size,
            }

            if matches!(total, Some(total) if offset >= total) {
                return;
            }
        }

        warn!(
            source = %source.tag,
            max_pages = paging.max_pages,
            offset,
            total = ?total,
            "Stopped paging at the page limit"
        );
    }
}
