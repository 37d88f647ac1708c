//! Error types for all keyspan operations.

use std::fmt;

use thiserror::Error;

/// Top-level error type for keyspan operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Overflow(#[from] OverflowError),

    /// Point lookup or first/last-in-partition lookup found nothing.
    #[error("item not found")]
    NotFound,

    /// Caller-level insert collision: the `(partition_key, sort_key)` pair
    /// already exists.
    #[error("object already exists")]
    ObjectExists,
}

/// Which precondition a failed conditional write was guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionFailure {
    /// An insert guarded by "key must not exist" hit an existing record.
    KeyExists,
    /// A write guarded by the stored content hash found the object changed.
    Changed,
    /// A caller-supplied attribute condition did not hold.
    Custom,
}

impl fmt::Display for ConditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionFailure::KeyExists => write!(f, "key already exists"),
            ConditionFailure::Changed => write!(f, "object changed"),
            ConditionFailure::Custom => write!(f, "attribute condition not met"),
        }
    }
}

/// Errors from the write/transaction and delete/cleanup engines.
#[derive(Debug, Error)]
pub enum CommitError {
    /// A precondition on an insert/update/delete did not hold. Never
    /// retried.
    #[error("conditional request failed: {0}")]
    ConditionFailed(ConditionFailure),

    /// The backend aborted a transaction for a reason that is neither a
    /// precondition failure nor a retryable conflict.
    #[error("transaction aborted: {0}")]
    TransactionFailed(String),

    /// Write-write conflicts (or unprocessed batch-delete keys) persisted
    /// through the whole retry budget.
    #[error("transient conflict persisted after {attempts} attempts: {cause}")]
    Transient { attempts: u32, cause: String },
}

/// Errors surfaced by a `PartitionBackend` implementation.
///
/// Throughput errors are surfaced fatal from the engines: callers may retry
/// the whole operation, this layer does not hide backend unavailability.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("throughput exceeded: {0}")]
    Throttled(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("internal backend error: {0}")]
    Internal(String),
}

/// Errors from the item codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("attribute name '{name}' must be 3-10 characters (got {len})")]
    AttributeNameLength { name: String, len: usize },

    #[error("stored record is missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("stored column '{col}' has an unexpected type")]
    ColumnType { col: String },

    #[error("malformed absolute hash: {0}")]
    MalformedHash(String),

    #[error("partition key '{0}' does not carry the expected service prefix")]
    ForeignPartitionKey(String),
}

/// Errors from the overflow storage port.
#[derive(Debug, Error)]
pub enum OverflowError {
    /// No blob stored under the requested hash.
    #[error("no overflow payload stored for hash {0}")]
    NotFound(String),

    /// The deployment has no overflow store configured but an item required
    /// one. Overflow is strictly opt-in.
    #[error("item requires overflow storage but none is configured")]
    Disabled,

    #[error("overflow store error: {0}")]
    Store(String),
}

/// Invalid store configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid store configuration: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },
}

pub type Result<T> = std::result::Result<T, Error>;
