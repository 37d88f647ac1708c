//! Delete/cleanup engine: primary records, their version-index mirrors, and
//! overflow blobs.
//!
//! Batch deletes are best-effort at the backend: a response may report a
//! subset of keys as unprocessed, and only that subset is resubmitted,
//! under the same capped-exponential backoff as the transaction path.

use std::sync::Arc;

use tracing::warn;

use super::scan::ScanEngine;
use super::{Backoff, MAX_ATTEMPTS, surface_backend_error};
use crate::backend::{PartitionBackend, RecordKey};
use crate::error::{CommitError, Error};
use crate::overflow::OverflowStore;
use crate::types::AbsoluteHash;

/// Removes records and their satellite state.
pub struct CleanupEngine<B, O> {
    backend: Arc<B>,
    overflow: Arc<O>,
    scan: ScanEngine<B, O>,
    /// Keys per batch-delete request when purging a partition.
    batch_size: usize,
}

impl<B: PartitionBackend, O: OverflowStore> CleanupEngine<B, O> {
    pub(crate) fn new(
        backend: Arc<B>,
        overflow: Arc<O>,
        scan: ScanEngine<B, O>,
        batch_size: usize,
    ) -> Self {
        CleanupEngine {
            backend,
            overflow,
            scan,
            batch_size,
        }
    }

    /// Batch-delete keys, resubmitting only the unprocessed subset until
    /// none remain. Bounded by the shared attempt budget; exhaustion
    /// surfaces a transient failure rather than looping forever.
    pub fn delete_keys(&self, keys: &[RecordKey]) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut pending = keys.to_vec();
        let mut backoff = Backoff::new();

        for attempt in 1..=MAX_ATTEMPTS {
            pending = self
                .backend
                .delete_batch(&pending)
                .map_err(surface_backend_error)?;
            if pending.is_empty() {
                return Ok(());
            }
            warn!(
                unprocessed = pending.len(),
                attempt, "batch delete partially applied, resubmitting"
            );
            if attempt < MAX_ATTEMPTS {
                backoff.sleep();
            }
        }

        Err(CommitError::Transient {
            attempts: MAX_ATTEMPTS,
            cause: format!("{} keys still unprocessed", pending.len()),
        }
        .into())
    }

    /// Remove one item: its primary record, its version-index mirror, and
    /// (best-effort) its overflow blob.
    pub fn delete_item(
        &self,
        primary: RecordKey,
        mirror: RecordKey,
        overflow_hash: Option<&AbsoluteHash>,
    ) -> Result<(), Error> {
        self.delete_keys(&[primary, mirror])?;
        if let Some(hash) = overflow_hash {
            self.delete_blob(hash);
        }
        Ok(())
    }

    /// Purge a whole partition: page through it in `batch_size` chunks,
    /// batch-deleting each page and its overflow blobs, then remove the
    /// version-index mirror. Returns the number of primary records removed.
    pub fn delete_partition(
        &self,
        partition_key: &str,
        mirror: RecordKey,
    ) -> Result<usize, Error> {
        let mut removed = 0;
        let mut cursor: Option<String> = None;

        loop {
            let (metas, after) = self
                .scan
                .page_meta(partition_key, cursor.take(), self.batch_size)?;
            if metas.is_empty() && after.is_none() {
                break;
            }

            let keys: Vec<RecordKey> = metas.iter().map(|m| m.key.clone()).collect();
            self.delete_keys(&keys)?;
            for meta in &metas {
                if meta.overflowed {
                    self.delete_blob(&meta.hash);
                }
            }
            removed += metas.len();

            match after {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        self.delete_keys(std::slice::from_ref(&mirror))?;
        Ok(removed)
    }

    /// Overflow-blob deletes never propagate: a leaked blob is preferable
    /// to failing a delete whose primary record is already gone.
    fn delete_blob(&self, hash: &AbsoluteHash) {
        if let Err(e) = self.overflow.delete(hash) {
            warn!(error = %e, hash = %hash, "overflow blob delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::backend::memory::MemoryBackend;
    use crate::backend::{
        QueryPage, QueryRequest, Record, TransactError, WriteAction, WriteError,
    };
    use crate::codec;
    use crate::error::{BackendError, OverflowError};
    use crate::overflow::MemoryOverflow;
    use crate::types::{Item, MAX_INLINE_PAYLOAD};

    const SERVICE: &str = "svc";

    /// Backend whose batch deletes leave the last key unprocessed for the
    /// first N calls.
    struct StubbornBackend {
        inner: MemoryBackend,
        stubborn_calls: AtomicUsize,
        delete_calls: AtomicUsize,
    }

    impl StubbornBackend {
        fn new(stubborn_calls: usize) -> Self {
            StubbornBackend {
                inner: MemoryBackend::new(),
                stubborn_calls: AtomicUsize::new(stubborn_calls),
                delete_calls: AtomicUsize::new(0),
            }
        }
    }

    impl PartitionBackend for StubbornBackend {
        fn get(&self, key: &RecordKey) -> Result<Option<Record>, BackendError> {
            self.inner.get(key)
        }
        fn write(&self, action: &WriteAction) -> Result<(), WriteError> {
            self.inner.write(action)
        }
        fn transact(&self, actions: &[WriteAction]) -> Result<(), TransactError> {
            self.inner.transact(actions)
        }
        fn query(&self, request: &QueryRequest) -> Result<QueryPage, BackendError> {
            self.inner.query(request)
        }
        fn delete_batch(&self, keys: &[RecordKey]) -> Result<Vec<RecordKey>, BackendError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.stubborn_calls.load(Ordering::SeqCst);
            if remaining > 0 {
                self.stubborn_calls.store(remaining - 1, Ordering::SeqCst);
                let (held_back, applied) = keys.split_last().unwrap();
                self.inner.delete_batch(applied)?;
                return Ok(vec![held_back.clone()]);
            }
            self.inner.delete_batch(keys)
        }
        fn create_table(&self, dry_run: bool) -> Result<bool, BackendError> {
            self.inner.create_table(dry_run)
        }
        fn delete_table(&self, dry_run: bool) -> Result<bool, BackendError> {
            self.inner.delete_table(dry_run)
        }
    }

    /// Overflow store whose deletes always fail (fetch/store delegate).
    struct BrokenDeleteOverflow(MemoryOverflow);

    impl OverflowStore for BrokenDeleteOverflow {
        fn fetch(&self, hash: &AbsoluteHash) -> Result<String, OverflowError> {
            self.0.fetch(hash)
        }
        fn store(&self, item: &Item, was_already: bool) -> Result<bool, OverflowError> {
            self.0.store(item, was_already)
        }
        fn delete(&self, _hash: &AbsoluteHash) -> Result<(), OverflowError> {
            Err(OverflowError::Store("simulated outage".to_string()))
        }
    }

    fn cleanup<B: PartitionBackend, O: OverflowStore>(
        backend: Arc<B>,
        overflow: Arc<O>,
        batch_size: usize,
    ) -> CleanupEngine<B, O> {
        let scan = ScanEngine::new(Arc::clone(&backend), Arc::clone(&overflow), SERVICE.to_string());
        CleanupEngine::new(backend, overflow, scan, batch_size)
    }

    fn seed<B: PartitionBackend>(backend: &B, overflow: &impl OverflowStore, item: &Item, limit: usize) {
        let scoped = codec::scoped_partition_key(SERVICE, &item.partition_key);
        let encoded = codec::encode(item, &scoped, limit, 0).unwrap();
        if encoded.overflowed {
            overflow.store(item, false).unwrap();
        }
        backend
            .write(&WriteAction::Put {
                key: RecordKey::new(scoped, item.sort_key.clone()),
                attributes: encoded.put,
                condition: None,
            })
            .unwrap();
    }

    #[test]
    fn test_delete_keys_resubmits_unprocessed_subset() {
        let backend = Arc::new(StubbornBackend::new(2));
        let overflow = Arc::new(MemoryOverflow::new());
        seed(&*backend, &*overflow, &Item::new("p1", "s1", "{}", "doc"), MAX_INLINE_PAYLOAD);
        seed(&*backend, &*overflow, &Item::new("p1", "s2", "{}", "doc"), MAX_INLINE_PAYLOAD);

        let engine = cleanup(Arc::clone(&backend), overflow, 16);
        engine
            .delete_keys(&[
                RecordKey::new("svc#p1", "s1"),
                RecordKey::new("svc#p1", "s2"),
            ])
            .unwrap();

        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 3);
        assert!(backend.get(&RecordKey::new("svc#p1", "s2")).unwrap().is_none());
    }

    #[test]
    fn test_delete_keys_bounded_exhaustion() {
        let backend = Arc::new(StubbornBackend::new(usize::MAX));
        let engine = cleanup(Arc::clone(&backend), Arc::new(MemoryOverflow::new()), 16);

        let err = engine
            .delete_keys(&[RecordKey::new("svc#p1", "s1")])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Commit(CommitError::Transient { attempts: 11, .. })
        ));
        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_delete_item_removes_mirror_and_blob() {
        let backend = Arc::new(MemoryBackend::new());
        let overflow = Arc::new(MemoryOverflow::new());
        let big = Item::new("p1", "s1", "x".repeat(1024), "doc");
        seed(&*backend, &*overflow, &big, 256);
        backend
            .write(&WriteAction::Put {
                key: RecordKey::new("vix", "@version"),
                attributes: crate::types::AttrMap::new(),
                condition: None,
            })
            .unwrap();

        let engine = cleanup(Arc::clone(&backend), Arc::clone(&overflow), 16);
        engine
            .delete_item(
                RecordKey::new("svc#p1", "s1"),
                RecordKey::new("vix", "@version"),
                Some(&big.absolute_hash),
            )
            .unwrap();

        assert!(backend.get(&RecordKey::new("svc#p1", "s1")).unwrap().is_none());
        assert!(backend.get(&RecordKey::new("vix", "@version")).unwrap().is_none());
        assert!(overflow.is_empty());
    }

    #[test]
    fn test_blob_delete_failure_is_logged_not_propagated() {
        let backend = Arc::new(MemoryBackend::new());
        let overflow = Arc::new(BrokenDeleteOverflow(MemoryOverflow::new()));
        let big = Item::new("p1", "s1", "x".repeat(1024), "doc");
        seed(&*backend, &*overflow, &big, 256);

        let engine = cleanup(Arc::clone(&backend), overflow, 16);
        engine
            .delete_item(
                RecordKey::new("svc#p1", "s1"),
                RecordKey::new("vix", "@version"),
                Some(&big.absolute_hash),
            )
            .unwrap();
        assert!(backend.get(&RecordKey::new("svc#p1", "s1")).unwrap().is_none());
    }

    #[test]
    fn test_delete_partition_pages_through() {
        let backend = Arc::new(MemoryBackend::new());
        let overflow = Arc::new(MemoryOverflow::new());
        for i in 0..30 {
            seed(
                &*backend,
                &*overflow,
                &Item::new("p1", format!("s{i:02}"), "{}", "doc"),
                MAX_INLINE_PAYLOAD,
            );
        }
        let big = Item::new("p1", "s99", "x".repeat(1024), "doc");
        seed(&*backend, &*overflow, &big, 256);
        let mirror = RecordKey::new("vix", "@version");
        backend
            .write(&WriteAction::Put {
                key: mirror.clone(),
                attributes: crate::types::AttrMap::new(),
                condition: None,
            })
            .unwrap();

        let engine = cleanup(Arc::clone(&backend), Arc::clone(&overflow), 12);
        let removed = engine.delete_partition("p1", mirror.clone()).unwrap();

        assert_eq!(removed, 31);
        assert!(backend.get(&RecordKey::new("svc#p1", "s00")).unwrap().is_none());
        assert!(backend.get(&RecordKey::new("svc#p1", "s99")).unwrap().is_none());
        assert!(backend.get(&mirror).unwrap().is_none());
        assert!(overflow.is_empty());
    }

    #[test]
    fn test_delete_partition_empty_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = cleanup(backend, Arc::new(MemoryOverflow::new()), 12);
        let removed = engine
            .delete_partition("p1", RecordKey::new("vix", "@version"))
            .unwrap();
        assert_eq!(removed, 0);
    }
}
