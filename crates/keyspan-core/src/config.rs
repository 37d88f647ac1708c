//! Store configuration, validated once at construction.
//!
//! All tunables that the original deployment juggled through builders and
//! process-wide flags live here and are injected explicitly.

use crate::error::ConfigError;
use crate::types::MAX_INLINE_PAYLOAD;

/// Separator between the service id and the caller's partition key.
pub const SERVICE_KEY_SEPARATOR: char = '#';

/// Configuration for a [`PartitionedStore`](crate::store::PartitionedStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prefixed onto every caller partition key; shared by all callers using
    /// the same service identifier. Must be non-empty and must not contain
    /// the separator.
    pub service_id: String,
    /// Items whose estimated encoded size reaches this limit spill their
    /// payload to the overflow store. Capped at [`MAX_INLINE_PAYLOAD`].
    pub payload_limit: usize,
    /// Keys per batch-delete request when purging a partition.
    pub delete_batch_size: usize,
}

impl StoreConfig {
    /// Config with defaults for everything but the service id.
    pub fn new(service_id: impl Into<String>) -> Self {
        StoreConfig {
            service_id: service_id.into(),
            payload_limit: MAX_INLINE_PAYLOAD,
            delete_batch_size: 16,
        }
    }

    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = limit;
        self
    }

    pub fn with_delete_batch_size(mut self, size: usize) -> Self {
        self.delete_batch_size = size;
        self
    }

    /// Validate every field, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.service_id.is_empty() {
            errors.push("service_id must not be empty".to_string());
        }
        if self.service_id.contains(SERVICE_KEY_SEPARATOR) {
            errors.push(format!(
                "service_id must not contain '{SERVICE_KEY_SEPARATOR}'"
            ));
        }
        if self.payload_limit == 0 {
            errors.push("payload_limit must be positive".to_string());
        }
        if self.payload_limit > MAX_INLINE_PAYLOAD {
            errors.push(format!(
                "payload_limit {} exceeds the backend item cap of {} bytes",
                self.payload_limit, MAX_INLINE_PAYLOAD
            ));
        }
        if self.delete_batch_size == 0 || self.delete_batch_size > 25 {
            errors.push(format!(
                "delete_batch_size {} outside the supported range 1-25",
                self.delete_batch_size
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }
}
