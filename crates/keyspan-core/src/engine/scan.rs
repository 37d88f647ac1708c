//! Partition scan engine: directional range scans with opaque pagination
//! cursors and transparent overflow resolution.

use std::sync::Arc;

use super::surface_backend_error;
use crate::backend::{PartitionBackend, QueryRequest, RecordKey};
use crate::codec;
use crate::error::Error;
use crate::overflow::OverflowStore;
use crate::types::{AbsoluteHash, AttrMap, Item};

/// A directional scan of one partition.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Caller-scoped partition key (the service prefix is applied
    /// internally).
    pub partition_key: String,
    /// Ascending sort-key order when true, descending otherwise.
    pub forward: bool,
    /// Maximum number of evaluated items per page; `None` = no page limit.
    pub limit: Option<usize>,
    /// Cursor from a previous page: the exclusive sort key to resume from.
    pub after: Option<String>,
    /// Restrict to sort keys with this prefix.
    pub sort_key_prefix: Option<String>,
    /// Server-side equality filters; narrow the surfaced set without
    /// changing cursor positions.
    pub filter: AttrMap,
}

impl ScanRequest {
    pub fn partition(partition_key: impl Into<String>) -> Self {
        ScanRequest {
            partition_key: partition_key.into(),
            forward: true,
            limit: None,
            after: None,
            sort_key_prefix: None,
            filter: AttrMap::new(),
        }
    }

    pub fn reverse(mut self) -> Self {
        self.forward = false;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    pub fn with_sort_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sort_key_prefix = Some(prefix.into());
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<crate::types::AttrValue>) -> Self {
        self.filter.insert(name.into(), value.into());
        self
    }
}

/// Cursors bounding one page of scan results.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    /// First surfaced item's sort key, present only when the request
    /// carried an `after` cursor (enabling backward paging). The empty
    /// string when a resume yielded zero results.
    pub before: Option<String>,
    /// Cursor to resume from: the last evaluated sort key when the page
    /// ended mid-partition, `None` at true end-of-partition.
    pub after: Option<String>,
}

/// Key and overflow metadata for one stored record, surfaced to cleanup
/// paths that must not resolve payloads.
pub(crate) struct RecordMeta {
    pub key: RecordKey,
    pub hash: AbsoluteHash,
    pub overflowed: bool,
}

/// Scans partitions in sort-key order, resolving overflowed payloads
/// through the overflow port as items are surfaced.
pub struct ScanEngine<B, O> {
    backend: Arc<B>,
    overflow: Arc<O>,
    service_id: String,
}

impl<B: PartitionBackend, O: OverflowStore> ScanEngine<B, O> {
    pub(crate) fn new(backend: Arc<B>, overflow: Arc<O>, service_id: String) -> Self {
        ScanEngine {
            backend,
            overflow,
            service_id,
        }
    }

    /// Scan one page, feeding each surfaced item to `on_item`.
    ///
    /// Items stored without an inline payload are resolved synchronously
    /// through the overflow port, so callers always observe a full payload.
    pub fn scan(
        &self,
        request: &ScanRequest,
        mut on_item: impl FnMut(Item),
    ) -> Result<ScanPage, Error> {
        let query = QueryRequest {
            partition_key: codec::scoped_partition_key(&self.service_id, &request.partition_key),
            forward: request.forward,
            limit: request.limit,
            exclusive_start: request.after.clone(),
            sort_key_prefix: request.sort_key_prefix.clone(),
            filter: request.filter.clone(),
        };
        let page = self.backend.query(&query).map_err(surface_backend_error)?;

        let mut first_sort_key: Option<String> = None;
        for (sort_key, record) in &page.records {
            let mut item = codec::decode(&record.attributes, &self.service_id)?;
            if item.payload.is_none() {
                item.payload = Some(self.overflow.fetch(&item.absolute_hash)?);
            }
            if first_sort_key.is_none() {
                first_sort_key = Some(sort_key.clone());
            }
            on_item(item);
        }

        // `before` only makes sense on a resumed page; an empty string
        // signals "resume requested but nothing left".
        let before = request
            .after
            .as_ref()
            .map(|_| first_sort_key.unwrap_or_default());

        Ok(ScanPage {
            before,
            after: page.last_evaluated,
        })
    }

    /// One forward page of key/overflow metadata, for the cleanup engine.
    pub(crate) fn page_meta(
        &self,
        partition_key: &str,
        after: Option<String>,
        page_size: usize,
    ) -> Result<(Vec<RecordMeta>, Option<String>), Error> {
        let scoped = codec::scoped_partition_key(&self.service_id, partition_key);
        let query = QueryRequest {
            partition_key: scoped.clone(),
            forward: true,
            limit: Some(page_size),
            exclusive_start: after,
            sort_key_prefix: None,
            filter: AttrMap::new(),
        };
        let page = self.backend.query(&query).map_err(surface_backend_error)?;

        let mut metas = Vec::with_capacity(page.records.len());
        for (sort_key, record) in &page.records {
            let item = codec::decode(&record.attributes, &self.service_id)?;
            metas.push(RecordMeta {
                key: RecordKey::new(scoped.clone(), sort_key.clone()),
                hash: item.absolute_hash,
                overflowed: item.payload.is_none(),
            });
        }
        Ok((metas, page.last_evaluated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WriteAction;
    use crate::backend::memory::MemoryBackend;
    use crate::overflow::MemoryOverflow;
    use crate::types::MAX_INLINE_PAYLOAD;

    const SERVICE: &str = "svc";

    fn engine() -> ScanEngine<MemoryBackend, MemoryOverflow> {
        ScanEngine::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryOverflow::new()),
            SERVICE.to_string(),
        )
    }

    fn seed(engine: &ScanEngine<MemoryBackend, MemoryOverflow>, item: &Item, limit: usize) {
        let scoped = codec::scoped_partition_key(SERVICE, &item.partition_key);
        let encoded = codec::encode(item, &scoped, limit, 1_700_000_000).unwrap();
        if encoded.overflowed {
            engine.overflow.store(item, false).unwrap();
        }
        engine
            .backend
            .write(&WriteAction::Put {
                key: RecordKey::new(scoped, item.sort_key.clone()),
                attributes: encoded.put,
                condition: None,
            })
            .unwrap();
    }

    fn collect(
        engine: &ScanEngine<MemoryBackend, MemoryOverflow>,
        request: &ScanRequest,
    ) -> (Vec<Item>, ScanPage) {
        let mut items = Vec::new();
        let page = engine.scan(request, |item| items.push(item)).unwrap();
        (items, page)
    }

    #[test]
    fn test_two_page_cursor_walk() {
        let engine = engine();
        seed(&engine, &Item::new("p1", "s1", r#"{"x":1}"#, "doc"), MAX_INLINE_PAYLOAD);
        seed(&engine, &Item::new("p1", "s2", r#"{"x":2}"#, "doc"), MAX_INLINE_PAYLOAD);

        let (items, page) = collect(&engine, &ScanRequest::partition("p1").with_limit(1));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sort_key, "s1");
        assert_eq!(page.after.as_deref(), Some("s1"));
        assert_eq!(page.before, None);

        let (items, page) = collect(
            &engine,
            &ScanRequest::partition("p1").with_limit(1).with_after("s1"),
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sort_key, "s2");
        assert_eq!(page.after, None);
        assert_eq!(page.before.as_deref(), Some("s2"));
    }

    #[test]
    fn test_resume_past_end_yields_empty_before() {
        let engine = engine();
        seed(&engine, &Item::new("p1", "s1", "{}", "doc"), MAX_INLINE_PAYLOAD);

        let (items, page) = collect(&engine, &ScanRequest::partition("p1").with_after("s1"));
        assert!(items.is_empty());
        assert_eq!(page.before.as_deref(), Some(""));
        assert_eq!(page.after, None);
    }

    #[test]
    fn test_reverse_scan() {
        let engine = engine();
        for sk in ["s1", "s2", "s3"] {
            seed(&engine, &Item::new("p1", sk, "{}", "doc"), MAX_INLINE_PAYLOAD);
        }
        let (items, _) = collect(&engine, &ScanRequest::partition("p1").reverse());
        let keys: Vec<&str> = items.iter().map(|i| i.sort_key.as_str()).collect();
        assert_eq!(keys, ["s3", "s2", "s1"]);
    }

    #[test]
    fn test_sort_key_prefix_and_filter() {
        let engine = engine();
        seed(
            &engine,
            &Item::new("p1", "a1", "{}", "doc").with_attribute("tag", "keep"),
            MAX_INLINE_PAYLOAD,
        );
        seed(
            &engine,
            &Item::new("p1", "b1", "{}", "doc").with_attribute("tag", "keep"),
            MAX_INLINE_PAYLOAD,
        );
        seed(
            &engine,
            &Item::new("p1", "b2", "{}", "doc").with_attribute("tag", "drop"),
            MAX_INLINE_PAYLOAD,
        );

        let request = ScanRequest::partition("p1")
            .with_sort_key_prefix("b")
            .with_filter("tag", "keep");
        let (items, page) = collect(&engine, &request);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sort_key, "b1");
        assert_eq!(page.after, None);
    }

    #[test]
    fn test_overflowed_item_resolved_through_port() {
        let engine = engine();
        let big = Item::new("p1", "s1", "x".repeat(1024), "doc");
        seed(&engine, &big, 256);

        let (items, _) = collect(&engine, &ScanRequest::partition("p1"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload.as_deref(), Some(&*"x".repeat(1024)));
    }

    #[test]
    fn test_page_meta_reports_overflow() {
        let engine = engine();
        seed(&engine, &Item::new("p1", "s1", "{}", "doc"), MAX_INLINE_PAYLOAD);
        let big = Item::new("p1", "s2", "x".repeat(1024), "doc");
        seed(&engine, &big, 256);

        let (metas, after) = engine.page_meta("p1", None, 10).unwrap();
        assert_eq!(after, None);
        assert_eq!(metas.len(), 2);
        assert!(!metas[0].overflowed);
        assert!(metas[1].overflowed);
        assert_eq!(metas[1].hash, big.absolute_hash);
        assert_eq!(metas[1].key, RecordKey::new("svc#p1", "s2"));
    }
}
