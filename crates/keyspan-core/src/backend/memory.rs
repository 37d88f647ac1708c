//! Reference in-memory backend.
//!
//! A single-process, map-based implementation of the full
//! [`PartitionBackend`] contract, used to validate behavioral equivalence
//! without a live backend. Transactions are all-or-nothing under one write
//! lock, which stands in for the remote store's transaction isolation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::info;

use super::{
    AbortReason, PartitionBackend, QueryPage, QueryRequest, Record, RecordKey, TransactAbort,
    TransactError, WriteAction, WriteError,
};
use crate::codec::{COL_PARTITION_KEY, COL_SORT_KEY};
use crate::error::BackendError;
use crate::types::{AttrMap, AttrValue};

type Partition = BTreeMap<String, Record>;

#[derive(Default)]
struct MemoryState {
    table_exists: bool,
    partitions: HashMap<String, Partition>,
}

/// Map-based reference backend.
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    /// Records whose value under this column is a non-zero epoch in the
    /// past are invisible to every read path.
    expiry_column: Option<String>,
}

impl MemoryBackend {
    /// Backend with the table already provisioned and no expiry column.
    pub fn new() -> Self {
        MemoryBackend {
            state: RwLock::new(MemoryState {
                table_exists: true,
                partitions: HashMap::new(),
            }),
            expiry_column: None,
        }
    }

    pub fn with_expiry_column(mut self, column: impl Into<String>) -> Self {
        self.expiry_column = Some(column.into());
        self
    }

    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn is_expired(&self, record: &Record, now: f64) -> bool {
        let Some(column) = &self.expiry_column else {
            return false;
        };
        match record.attributes.get(column) {
            Some(AttrValue::Num(epoch)) => *epoch != 0.0 && *epoch <= now,
            _ => false,
        }
    }

    /// Current live record under the key; expired records read as absent.
    fn live<'a>(&self, state: &'a MemoryState, key: &RecordKey, now: f64) -> Option<&'a Record> {
        state
            .partitions
            .get(&key.partition_key)
            .and_then(|p| p.get(&key.sort_key))
            .filter(|r| !self.is_expired(r, now))
    }

    fn apply(state: &mut MemoryState, action: &WriteAction) {
        match action {
            WriteAction::Put { key, attributes, .. } => {
                state
                    .partitions
                    .entry(key.partition_key.clone())
                    .or_default()
                    .insert(
                        key.sort_key.clone(),
                        Record {
                            attributes: attributes.clone(),
                        },
                    );
            }
            WriteAction::Update { key, deltas, .. } => {
                let partition = state.partitions.entry(key.partition_key.clone()).or_default();
                let record = partition.entry(key.sort_key.clone()).or_insert_with(|| {
                    // Unconditional update of an absent key upserts a base
                    // record carrying just the key columns.
                    let mut attributes = AttrMap::new();
                    attributes.insert(
                        COL_PARTITION_KEY.to_string(),
                        AttrValue::Str(key.partition_key.clone()),
                    );
                    attributes.insert(
                        COL_SORT_KEY.to_string(),
                        AttrValue::Str(key.sort_key.clone()),
                    );
                    Record { attributes }
                });
                for (name, value) in deltas {
                    record.attributes.insert(name.clone(), value.clone());
                }
            }
            WriteAction::Delete { key, .. } => {
                if let Some(partition) = state.partitions.get_mut(&key.partition_key) {
                    partition.remove(&key.sort_key);
                    if partition.is_empty() {
                        state.partitions.remove(&key.partition_key);
                    }
                }
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionBackend for MemoryBackend {
    fn get(&self, key: &RecordKey) -> Result<Option<Record>, BackendError> {
        let state = self.state.read();
        Ok(self.live(&state, key, Self::now_epoch()).cloned())
    }

    fn write(&self, action: &WriteAction) -> Result<(), WriteError> {
        let mut state = self.state.write();
        let now = Self::now_epoch();
        if let Some(condition) = action.condition() {
            let existing = self.live(&state, action.key(), now);
            if !condition.eval(existing) {
                return Err(WriteError::ConditionFailed);
            }
        }
        Self::apply(&mut state, action);
        Ok(())
    }

    fn transact(&self, actions: &[WriteAction]) -> Result<(), TransactError> {
        let mut seen = HashSet::new();
        for action in actions {
            if !seen.insert(action.key().clone()) {
                return Err(BackendError::Internal(format!(
                    "duplicate key in transaction: {}/{}",
                    action.key().partition_key,
                    action.key().sort_key
                ))
                .into());
            }
        }

        let mut state = self.state.write();
        let now = Self::now_epoch();

        // Conditions are evaluated against the pre-transaction state;
        // either every action applies or none do.
        let reasons: Vec<AbortReason> = actions
            .iter()
            .map(|action| match action.condition() {
                Some(condition) if !condition.eval(self.live(&state, action.key(), now)) => {
                    AbortReason::ConditionFailed
                }
                _ => AbortReason::None,
            })
            .collect();

        if reasons.iter().any(|r| *r != AbortReason::None) {
            return Err(TransactError::Canceled(TransactAbort { reasons }));
        }

        for action in actions {
            Self::apply(&mut state, action);
        }
        Ok(())
    }

    fn query(&self, request: &QueryRequest) -> Result<QueryPage, BackendError> {
        let state = self.state.read();
        let now = Self::now_epoch();

        let Some(partition) = state.partitions.get(&request.partition_key) else {
            return Ok(QueryPage {
                records: Vec::new(),
                last_evaluated: None,
            });
        };

        // Directional range with an exclusive resume position.
        let bounds: (Bound<&String>, Bound<&String>) = match &request.exclusive_start {
            Some(start) if request.forward => (Bound::Excluded(start), Bound::Unbounded),
            Some(start) => (Bound::Unbounded, Bound::Excluded(start)),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let in_range: Vec<(&String, &Record)> = if request.forward {
            partition.range::<String, _>(bounds).collect()
        } else {
            partition.range::<String, _>(bounds).rev().collect()
        };

        // Sort-key prefix is a key condition: non-matching keys are never
        // evaluated. Expired records are invisible entirely.
        let evaluated: Vec<(&String, &Record)> = in_range
            .into_iter()
            .filter(|(sort_key, _)| {
                request
                    .sort_key_prefix
                    .as_deref()
                    .is_none_or(|prefix| sort_key.starts_with(prefix))
            })
            .filter(|(_, record)| !self.is_expired(record, now))
            .collect();

        let mut records = Vec::new();
        let mut last_seen: Option<String> = None;
        let mut has_more = false;

        for (count, (sort_key, record)) in evaluated.iter().enumerate() {
            if let Some(limit) = request.limit
                && count >= limit
            {
                has_more = true;
                break;
            }
            last_seen = Some((*sort_key).clone());

            // Equality filters narrow the surfaced set without affecting
            // the cursor.
            let passes = request
                .filter
                .iter()
                .all(|(name, value)| record.attributes.get(name) == Some(value));
            if passes {
                records.push(((*sort_key).clone(), (*record).clone()));
            }
        }

        Ok(QueryPage {
            records,
            last_evaluated: if has_more { last_seen } else { None },
        })
    }

    fn delete_batch(&self, keys: &[RecordKey]) -> Result<Vec<RecordKey>, BackendError> {
        let mut state = self.state.write();
        for key in keys {
            if let Some(partition) = state.partitions.get_mut(&key.partition_key) {
                partition.remove(&key.sort_key);
                if partition.is_empty() {
                    state.partitions.remove(&key.partition_key);
                }
            }
        }
        Ok(Vec::new())
    }

    fn create_table(&self, dry_run: bool) -> Result<bool, BackendError> {
        let mut state = self.state.write();
        if state.table_exists {
            return Ok(false);
        }
        if dry_run {
            info!(dry_run, "would create table");
            return Ok(true);
        }
        state.table_exists = true;
        info!("table created");
        Ok(true)
    }

    fn delete_table(&self, dry_run: bool) -> Result<bool, BackendError> {
        let mut state = self.state.write();
        if !state.table_exists {
            return Ok(false);
        }
        if dry_run {
            info!(dry_run, "would delete table");
            return Ok(true);
        }
        state.table_exists = false;
        state.partitions.clear();
        info!("table deleted");
        Ok(true)
    }
}
