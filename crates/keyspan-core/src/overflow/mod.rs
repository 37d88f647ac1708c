//! Overflow storage port: the external blob store consulted when an item's
//! encoded size exceeds the payload limit.
//!
//! Consumed, never implemented, by the engines. Two strategies ship with the
//! crate: [`DisabledOverflow`] (the default; overflow is strictly opt-in
//! per deployment) and [`MemoryOverflow`] (the map-based reference).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::OverflowError;
use crate::types::{AbsoluteHash, Item};

/// Keyed blob store for payloads that did not fit inline.
pub trait OverflowStore {
    /// Fetch the payload stored under the hash. Fails
    /// [`OverflowError::NotFound`] when missing.
    fn fetch(&self, hash: &AbsoluteHash) -> Result<String, OverflowError>;

    /// Store the item's payload under its absolute hash.
    ///
    /// Implementations may skip the write when `was_already_overflowed`
    /// (the blob is content-addressed, so it is already present). Returns
    /// whether a write happened this call, so the caller knows whether a
    /// compensating delete is needed if the primary commit then fails.
    fn store(&self, item: &Item, was_already_overflowed: bool) -> Result<bool, OverflowError>;

    /// Remove the blob. Callers treat this as best-effort and log failures
    /// without propagating them.
    fn delete(&self, hash: &AbsoluteHash) -> Result<(), OverflowError>;
}

/// The no-overflow strategy: any item requiring overflow is a deployment
/// configuration error.
pub struct DisabledOverflow;

impl OverflowStore for DisabledOverflow {
    fn fetch(&self, _hash: &AbsoluteHash) -> Result<String, OverflowError> {
        Err(OverflowError::Disabled)
    }

    fn store(&self, _item: &Item, _was_already_overflowed: bool) -> Result<bool, OverflowError> {
        Err(OverflowError::Disabled)
    }

    fn delete(&self, _hash: &AbsoluteHash) -> Result<(), OverflowError> {
        Ok(())
    }
}

/// Map-based reference overflow store.
#[derive(Default)]
pub struct MemoryOverflow {
    blobs: RwLock<HashMap<AbsoluteHash, String>>,
}

impl MemoryOverflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored (test observability).
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl OverflowStore for MemoryOverflow {
    fn fetch(&self, hash: &AbsoluteHash) -> Result<String, OverflowError> {
        self.blobs
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| OverflowError::NotFound(hash.to_string()))
    }

    fn store(&self, item: &Item, was_already_overflowed: bool) -> Result<bool, OverflowError> {
        let mut blobs = self.blobs.write();
        if was_already_overflowed && blobs.contains_key(&item.absolute_hash) {
            // Content-addressed: the blob for this hash is already in place.
            return Ok(false);
        }
        let payload = item.payload.clone().ok_or_else(|| {
            OverflowError::Store("item has neither inline payload nor stored blob".to_string())
        })?;
        blobs.insert(item.absolute_hash, payload);
        Ok(true)
    }

    fn delete(&self, hash: &AbsoluteHash) -> Result<(), OverflowError> {
        self.blobs.write().remove(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_rejects_store_and_fetch() {
        let overflow = DisabledOverflow;
        let item = Item::new("p1", "s1", "{}", "config");
        assert!(matches!(
            overflow.store(&item, false),
            Err(OverflowError::Disabled)
        ));
        assert!(matches!(
            overflow.fetch(&item.absolute_hash),
            Err(OverflowError::Disabled)
        ));
        // Best-effort delete stays silent.
        assert!(overflow.delete(&item.absolute_hash).is_ok());
    }

    #[test]
    fn test_memory_store_fetch_delete() {
        let overflow = MemoryOverflow::new();
        let item = Item::new("p1", "s1", r#"{"big":true}"#, "config");

        assert!(overflow.store(&item, false).unwrap());
        assert_eq!(
            overflow.fetch(&item.absolute_hash).unwrap(),
            r#"{"big":true}"#
        );

        overflow.delete(&item.absolute_hash).unwrap();
        assert!(matches!(
            overflow.fetch(&item.absolute_hash),
            Err(OverflowError::NotFound(_))
        ));
    }

    #[test]
    fn test_memory_store_idempotent_skip() {
        let overflow = MemoryOverflow::new();
        let item = Item::new("p1", "s1", "payload", "config");

        assert!(overflow.store(&item, false).unwrap());
        // Already known overflowed: the write is deferred and the caller
        // learns no compensation is needed.
        assert!(!overflow.store(&item, true).unwrap());
        // Not flagged as already overflowed: the write happens again.
        assert!(overflow.store(&item, false).unwrap());
    }
}
