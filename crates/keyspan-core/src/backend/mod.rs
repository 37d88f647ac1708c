//! The partitioned conditional store contract.
//!
//! The backend is consumed as an opaque service: point get, directional
//! range query, single- and multi-item conditional writes, and batch delete.
//! Cross-process consistency is pushed entirely to the backend's
//! conditional-write semantics; this layer holds no locks of its own.

pub mod memory;

use thiserror::Error;

use crate::codec::COL_HASH;
use crate::error::{BackendError, ConditionFailure};
use crate::types::{AttrMap, AttrValue};

/// Fully-scoped primary key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Service-prefixed partition key.
    pub partition_key: String,
    pub sort_key: String,
}

impl RecordKey {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        RecordKey {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }
}

/// A stored record: the wire attribute map produced by the codec.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub attributes: AttrMap,
}

/// Precondition on the current stored state of one key.
///
/// Evaluated by the backend against the existing record (or its absence)
/// before a write applies. This is the sole mutual-exclusion mechanism the
/// store offers.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The key must not exist.
    Absent,
    /// The key must exist.
    Present,
    /// The named attribute of the existing record must equal the value.
    /// Fails when the record is absent.
    AttrEq(String, AttrValue),
    /// Every sub-condition must hold.
    All(Vec<Condition>),
}

impl Condition {
    /// Evaluate against the current record (or `None` when the key is
    /// absent).
    pub fn eval(&self, existing: Option<&Record>) -> bool {
        match self {
            Condition::Absent => existing.is_none(),
            Condition::Present => existing.is_some(),
            Condition::AttrEq(name, value) => {
                existing.is_some_and(|r| r.attributes.get(name) == Some(value))
            }
            Condition::All(conditions) => conditions.iter().all(|c| c.eval(existing)),
        }
    }

    /// Classify what a failure of this condition means to the caller:
    /// a guarded insert hit an existing key, a hash guard found the object
    /// changed, or a custom attribute condition did not hold.
    pub fn failure_kind(&self) -> ConditionFailure {
        if self.references_hash() {
            ConditionFailure::Changed
        } else if matches!(self, Condition::Absent) {
            ConditionFailure::KeyExists
        } else {
            ConditionFailure::Custom
        }
    }

    fn references_hash(&self) -> bool {
        match self {
            Condition::AttrEq(name, _) => name == COL_HASH,
            Condition::All(conditions) => conditions.iter().any(|c| c.references_hash()),
            _ => false,
        }
    }
}

/// One write in a transaction (or alone).
#[derive(Debug, Clone)]
pub enum WriteAction {
    /// Insert or replace the full record.
    Put {
        key: RecordKey,
        attributes: AttrMap,
        condition: Option<Condition>,
    },
    /// Overwrite the given attributes of an existing record, leaving the
    /// rest in place.
    Update {
        key: RecordKey,
        deltas: AttrMap,
        condition: Option<Condition>,
    },
    Delete {
        key: RecordKey,
        condition: Option<Condition>,
    },
}

impl WriteAction {
    pub fn key(&self) -> &RecordKey {
        match self {
            WriteAction::Put { key, .. }
            | WriteAction::Update { key, .. }
            | WriteAction::Delete { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            WriteAction::Put { condition, .. }
            | WriteAction::Update { condition, .. }
            | WriteAction::Delete { condition, .. } => condition.as_ref(),
        }
    }
}

/// Why one action of an aborted transaction could not apply.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// This action was fine; another action aborted the transaction.
    None,
    /// The action's precondition did not hold.
    ConditionFailed,
    /// The action collided with a concurrent transaction on the same item.
    Conflict,
    Other(String),
}

/// Per-action abort reasons, parallel to the submitted action list.
#[derive(Debug, Clone)]
pub struct TransactAbort {
    pub reasons: Vec<AbortReason>,
}

impl TransactAbort {
    pub fn any_condition_failed(&self) -> bool {
        self.reasons.contains(&AbortReason::ConditionFailed)
    }

    pub fn any_conflict(&self) -> bool {
        self.reasons.contains(&AbortReason::Conflict)
    }

    /// Index of the first action whose precondition failed.
    pub fn first_condition_failure(&self) -> Option<usize> {
        self.reasons
            .iter()
            .position(|r| *r == AbortReason::ConditionFailed)
    }

    pub fn describe(&self) -> String {
        self.reasons
            .iter()
            .enumerate()
            .filter(|(_, r)| **r != AbortReason::None)
            .map(|(i, r)| match r {
                AbortReason::ConditionFailed => format!("action {i}: condition failed"),
                AbortReason::Conflict => format!("action {i}: transaction conflict"),
                AbortReason::Other(msg) => format!("action {i}: {msg}"),
                AbortReason::None => unreachable!(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A single conditional write failed.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("the conditional request failed")]
    ConditionFailed,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A multi-item transaction failed.
#[derive(Debug, Error)]
pub enum TransactError {
    /// The backend aborted the transaction; per-action reasons attached.
    #[error("transaction canceled: {}", .0.describe())]
    Canceled(TransactAbort),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A directional range query over one partition.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Fully-scoped partition key.
    pub partition_key: String,
    /// Ascending sort-key order when true, descending otherwise.
    pub forward: bool,
    /// Maximum number of evaluated items; `None` = the whole partition.
    pub limit: Option<usize>,
    /// Exclusive resume position (a sort key) in the scan direction.
    pub exclusive_start: Option<String>,
    /// Restrict to sort keys with this prefix.
    pub sort_key_prefix: Option<String>,
    /// Server-side equality filters, applied after key selection. Filters
    /// narrow the returned set without affecting pagination: the
    /// last-evaluated key tracks position in the unfiltered key order.
    pub filter: AttrMap,
}

impl QueryRequest {
    pub fn partition(partition_key: impl Into<String>) -> Self {
        QueryRequest {
            partition_key: partition_key.into(),
            forward: true,
            limit: None,
            exclusive_start: None,
            sort_key_prefix: None,
            filter: AttrMap::new(),
        }
    }
}

/// One page of query results.
#[derive(Debug)]
pub struct QueryPage {
    /// Surfaced records with their sort keys, in scan order. Records that
    /// failed the equality filter are evaluated (they move the cursor) but
    /// not included.
    pub records: Vec<(String, Record)>,
    /// Sort key of the last evaluated item when the page ended before the
    /// partition did; `None` at true end-of-partition.
    pub last_evaluated: Option<String>,
}

/// The partitioned conditional store consumed by the engines.
///
/// Implementations must apply `transact` atomically: either every action
/// applies or none do, with per-action abort reasons on cancellation.
/// `delete_batch` may apply a subset and must report the unprocessed keys.
pub trait PartitionBackend {
    fn get(&self, key: &RecordKey) -> Result<Option<Record>, BackendError>;

    fn write(&self, action: &WriteAction) -> Result<(), WriteError>;

    fn transact(&self, actions: &[WriteAction]) -> Result<(), TransactError>;

    fn query(&self, request: &QueryRequest) -> Result<QueryPage, BackendError>;

    /// Best-effort bulk delete. Returns the subset of keys that were not
    /// processed and must be resubmitted.
    fn delete_batch(&self, keys: &[RecordKey]) -> Result<Vec<RecordKey>, BackendError>;

    /// Create the backing table if absent. Returns whether a create was (or
    /// would be, under `dry_run`) performed.
    fn create_table(&self, dry_run: bool) -> Result<bool, BackendError>;

    /// Delete the backing table. Returns whether a delete was (or would be,
    /// under `dry_run`) performed.
    fn delete_table(&self, dry_run: bool) -> Result<bool, BackendError>;
}
