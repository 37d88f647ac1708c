//! The partitioned store facade.
//!
//! Ties the codec, the engines, and the two ports together behind the
//! operations callers use. All mutation flows through here: items are
//! never written to the backend except via insert/update/delete on this
//! type (or a caller-assembled transaction).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::backend::{Condition, PartitionBackend, RecordKey, WriteAction};
use crate::codec::{self, COL_HASH, COL_LATEST_SORT_KEY, COL_PARTITION_KEY, COL_SORT_KEY};
use crate::config::{SERVICE_KEY_SEPARATOR, StoreConfig};
use crate::engine::delete::CleanupEngine;
use crate::engine::scan::{ScanEngine, ScanPage, ScanRequest};
use crate::engine::surface_backend_error;
use crate::engine::write::WriteEngine;
use crate::error::{CommitError, ConditionFailure, Error};
use crate::overflow::OverflowStore;
use crate::types::{AbsoluteHash, AttrMap, AttrValue, Item};

/// Fixed sort key of version-index mirror records.
pub const VERSION_SORT_KEY: &str = "@version";

/// Partitioned key-value store over a conditional backend and an overflow
/// blob port.
pub struct PartitionedStore<B, O> {
    backend: Arc<B>,
    overflow: Arc<O>,
    write: WriteEngine<B>,
    scan: ScanEngine<B, O>,
    cleanup: CleanupEngine<B, O>,
    config: StoreConfig,
}

impl<B: PartitionBackend, O: OverflowStore> PartitionedStore<B, O> {
    /// Build a store from a validated configuration.
    pub fn new(backend: B, overflow: O, config: StoreConfig) -> Result<Self, Error> {
        config.validate()?;
        let backend = Arc::new(backend);
        let overflow = Arc::new(overflow);
        let write = WriteEngine::new(Arc::clone(&backend));
        let scan = ScanEngine::new(
            Arc::clone(&backend),
            Arc::clone(&overflow),
            config.service_id.clone(),
        );
        let cleanup_scan = ScanEngine::new(
            Arc::clone(&backend),
            Arc::clone(&overflow),
            config.service_id.clone(),
        );
        let cleanup = CleanupEngine::new(
            Arc::clone(&backend),
            Arc::clone(&overflow),
            cleanup_scan,
            config.delete_batch_size,
        );
        Ok(PartitionedStore {
            backend,
            overflow,
            write,
            scan,
            cleanup,
            config,
        })
    }

    /// The overflow port this store was built with.
    pub fn overflow(&self) -> &O {
        &self.overflow
    }

    fn scoped_pk(&self, partition_key: &str) -> String {
        codec::scoped_partition_key(&self.config.service_id, partition_key)
    }

    fn primary_key(&self, partition_key: &str, sort_key: &str) -> RecordKey {
        RecordKey::new(self.scoped_pk(partition_key), sort_key)
    }

    /// Key of the partition's version-index mirror: the scoped partition
    /// key prefixed with its own hash (spreading hot partitions), under a
    /// fixed sort key.
    fn version_index_key(&self, partition_key: &str) -> RecordKey {
        let scoped = self.scoped_pk(partition_key);
        let hashed = format!(
            "{:016x}{SERVICE_KEY_SEPARATOR}{scoped}",
            xxh3_64(scoped.as_bytes())
        );
        RecordKey::new(hashed, VERSION_SORT_KEY)
    }

    /// Upsert of the partition's latest-version pointer, carried in the
    /// same transaction as every primary write.
    fn mirror_action(&self, item: &Item) -> WriteAction {
        let key = self.version_index_key(&item.partition_key);
        let mut attributes = AttrMap::new();
        attributes.insert(
            COL_PARTITION_KEY.to_string(),
            AttrValue::Str(key.partition_key.clone()),
        );
        attributes.insert(
            COL_SORT_KEY.to_string(),
            AttrValue::Str(VERSION_SORT_KEY.to_string()),
        );
        attributes.insert(
            COL_LATEST_SORT_KEY.to_string(),
            AttrValue::Str(item.sort_key.clone()),
        );
        attributes.insert(
            COL_HASH.to_string(),
            AttrValue::Str(item.absolute_hash.to_string()),
        );
        WriteAction::Put {
            key,
            attributes,
            condition: None,
        }
    }

    fn now_epoch() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Encode an item and, when it overflows, stage its blob ahead of the
    /// commit. Returns whether a blob write happened this call.
    fn encode_and_stage(&self, item: &Item) -> Result<(codec::EncodedItem, bool), Error> {
        let scoped = self.scoped_pk(&item.partition_key);
        let encoded = codec::encode(item, &scoped, self.config.payload_limit, Self::now_epoch())?;
        let blob_written = if encoded.overflowed {
            // An item arriving with no inline payload was already
            // overflowed; the port may skip the write.
            self.overflow.store(item, item.payload.is_none())?
        } else {
            false
        };
        Ok((encoded, blob_written))
    }

    /// Best-effort blob delete: compensates a failed commit or cleans up
    /// after a guarded delete. Its own failure is logged and never masks
    /// the original error.
    fn delete_blob(&self, hash: &AbsoluteHash) {
        if let Err(e) = self.overflow.delete(hash) {
            warn!(error = %e, hash = %hash, "overflow blob delete failed");
        }
    }

    /// Insert an item, together with its version-index mirror, atomically.
    ///
    /// With `must_not_exist` the write is guarded on the key being absent
    /// and a collision surfaces as [`Error::ObjectExists`] without mutating
    /// the existing record.
    pub fn insert(&self, item: &Item, must_not_exist: bool) -> Result<(), Error> {
        let (encoded, blob_written) = self.encode_and_stage(item)?;
        let primary = WriteAction::Put {
            key: self.primary_key(&item.partition_key, &item.sort_key),
            attributes: encoded.put,
            condition: must_not_exist.then_some(Condition::Absent),
        };
        let txn = self.write.begin(vec![primary, self.mirror_action(item)]);
        self.write.commit(&txn).map_err(|e| {
            if blob_written {
                self.delete_blob(&item.absolute_hash);
            }
            match e {
                Error::Commit(CommitError::ConditionFailed(ConditionFailure::KeyExists)) => {
                    Error::ObjectExists
                }
                other => other,
            }
        })
    }

    /// Conditionally update an item in place, guarded on the stored content
    /// hash: the write only applies if the object has not changed since
    /// `expected_hash` was read. Fails
    /// [`ConditionFailure::Changed`](crate::error::ConditionFailure)
    /// otherwise.
    pub fn update(&self, item: &Item, expected_hash: &AbsoluteHash) -> Result<(), Error> {
        let (encoded, blob_written) = self.encode_and_stage(item)?;
        let condition = Condition::All(vec![
            Condition::Present,
            Condition::AttrEq(
                COL_HASH.to_string(),
                AttrValue::Str(expected_hash.to_string()),
            ),
        ]);
        let primary = WriteAction::Update {
            key: self.primary_key(&item.partition_key, &item.sort_key),
            deltas: encoded.delta,
            condition: Some(condition),
        };
        let txn = self.write.begin(vec![primary, self.mirror_action(item)]);
        self.write.commit(&txn).map_err(|e| {
            if blob_written {
                self.delete_blob(&item.absolute_hash);
            }
            e
        })
    }

    /// Insert several items as one atomic transaction: either every item
    /// (and mirror) applies or none do.
    pub fn put_all(&self, items: &[Item], must_not_exist: bool) -> Result<(), Error> {
        let mut actions = Vec::with_capacity(items.len());
        let mut staged: Vec<AbsoluteHash> = Vec::new();
        // One mirror per partition; the last item written to a partition
        // becomes its latest-version pointer.
        let mut mirrors: BTreeMap<String, WriteAction> = BTreeMap::new();

        for item in items {
            match self.encode_and_stage(item) {
                Ok((encoded, blob_written)) => {
                    if blob_written {
                        staged.push(item.absolute_hash);
                    }
                    actions.push(WriteAction::Put {
                        key: self.primary_key(&item.partition_key, &item.sort_key),
                        attributes: encoded.put,
                        condition: must_not_exist.then_some(Condition::Absent),
                    });
                    mirrors.insert(item.partition_key.clone(), self.mirror_action(item));
                }
                Err(e) => {
                    for hash in &staged {
                        self.delete_blob(hash);
                    }
                    return Err(e);
                }
            }
        }
        actions.extend(mirrors.into_values());

        let txn = self.write.begin(actions);
        self.write.commit(&txn).map_err(|e| {
            for hash in &staged {
                self.delete_blob(hash);
            }
            match e {
                Error::Commit(CommitError::ConditionFailed(ConditionFailure::KeyExists))
                    if must_not_exist =>
                {
                    Error::ObjectExists
                }
                other => other,
            }
        })
    }

    /// Submit caller-assembled write actions as one atomic transaction,
    /// with the engine's conflict-retry policy.
    pub fn transact(&self, actions: Vec<WriteAction>) -> Result<(), Error> {
        let txn = self.write.begin(actions);
        self.write.commit(&txn)
    }

    /// Point fetch. Absence is a result, not an error; an overflowed
    /// payload is resolved through the overflow port before returning.
    pub fn fetch(&self, partition_key: &str, sort_key: &str) -> Result<Option<Item>, Error> {
        let record = self
            .backend
            .get(&self.primary_key(partition_key, sort_key))
            .map_err(surface_backend_error)?;
        let Some(record) = record else {
            return Ok(None);
        };
        let mut item = codec::decode(&record.attributes, &self.config.service_id)?;
        if item.payload.is_none() {
            item.payload = Some(self.overflow.fetch(&item.absolute_hash)?);
        }
        Ok(Some(item))
    }

    /// First item of a partition in sort-key order.
    /// Fails [`Error::NotFound`] when the partition is empty.
    pub fn first(&self, partition_key: &str) -> Result<Item, Error> {
        self.endpoint(partition_key, true)
    }

    /// Last item of a partition in sort-key order.
    /// Fails [`Error::NotFound`] when the partition is empty.
    pub fn last(&self, partition_key: &str) -> Result<Item, Error> {
        self.endpoint(partition_key, false)
    }

    fn endpoint(&self, partition_key: &str, forward: bool) -> Result<Item, Error> {
        let mut request = ScanRequest::partition(partition_key).with_limit(1);
        request.forward = forward;
        let mut found = None;
        self.scan.scan(&request, |item| found = Some(item))?;
        found.ok_or(Error::NotFound)
    }

    /// Scan one page of a partition, feeding each item to `on_item`.
    pub fn scan(
        &self,
        request: &ScanRequest,
        on_item: impl FnMut(Item),
    ) -> Result<ScanPage, Error> {
        self.scan.scan(request, on_item)
    }

    /// Remove an item, its version-index mirror, and (best-effort) its
    /// overflow blob. Deleting an absent item is a no-op.
    pub fn delete(&self, partition_key: &str, sort_key: &str) -> Result<(), Error> {
        let key = self.primary_key(partition_key, sort_key);
        let Some(record) = self.backend.get(&key).map_err(surface_backend_error)? else {
            return Ok(());
        };
        let item = codec::decode(&record.attributes, &self.config.service_id)?;
        let overflow_hash = item.payload.is_none().then_some(item.absolute_hash);
        self.cleanup
            .delete_item(key, self.version_index_key(partition_key), overflow_hash.as_ref())
    }

    /// Conditionally delete a single record, guarded on the stored content
    /// hash. A single-item conditional write: the delete only applies if
    /// the object still matches `expected_hash`, and a failure surfaces as
    /// [`ConditionFailure::Changed`](crate::error::ConditionFailure)
    /// without retry. Satellite state (mirror, blob) is cleaned up after
    /// the guarded delete succeeds.
    pub fn delete_if_unchanged(
        &self,
        partition_key: &str,
        sort_key: &str,
        expected_hash: &AbsoluteHash,
    ) -> Result<(), Error> {
        let key = self.primary_key(partition_key, sort_key);
        // Capture the overflow pointer before the record disappears.
        let overflow_hash = match self.backend.get(&key).map_err(surface_backend_error)? {
            Some(record) => {
                let item = codec::decode(&record.attributes, &self.config.service_id)?;
                item.payload.is_none().then_some(item.absolute_hash)
            }
            None => None,
        };

        let action = WriteAction::Delete {
            key,
            condition: Some(Condition::All(vec![
                Condition::Present,
                Condition::AttrEq(
                    COL_HASH.to_string(),
                    AttrValue::Str(expected_hash.to_string()),
                ),
            ])),
        };
        self.write.store(&action)?;

        self.cleanup.delete_keys(std::slice::from_ref(&self.version_index_key(partition_key)))?;
        if let Some(hash) = overflow_hash {
            self.delete_blob(&hash);
        }
        Ok(())
    }

    /// Purge every item in a partition (and its mirror and overflow blobs).
    /// Returns the number of primary records removed.
    pub fn delete_partition(&self, partition_key: &str) -> Result<usize, Error> {
        self.cleanup
            .delete_partition(partition_key, self.version_index_key(partition_key))
    }

    /// Create the backing table if absent. Under `dry_run` the intended
    /// change is logged but not applied.
    pub fn ensure_table(&self, dry_run: bool) -> Result<bool, Error> {
        self.backend
            .create_table(dry_run)
            .map_err(surface_backend_error)
    }

    /// Delete the backing table. Under `dry_run` the intended change is
    /// logged but not applied.
    pub fn drop_table(&self, dry_run: bool) -> Result<bool, Error> {
        self.backend
            .delete_table(dry_run)
            .map_err(surface_backend_error)
    }
}
