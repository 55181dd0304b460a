//! Merging a local and a remote collection.
//!
//! Merging is pure and deterministic: the same inputs and strategy always
//! produce the same output. The output never contains two records with the
//! same id.
//!
//! # Strategies
//!
//! - `server_wins` / `local_wins`: one side is returned untouched.
//! - `latest_wins`: union by id; on a shared id the strictly newer
//!   `updatedAt` wins, ties keep the remote record.
//! - `merge`: union by id; shared ids are combined field by field.
//! - `manual`: union by id; shared ids whose content differs are reported as
//!   [`Conflict`]s for the caller to resolve.

use crate::{
    record::{timestamp_millis, UPDATED_AT_FIELD},
    Collection, Record,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Default name of the nested line-items field used by field-level merges.
pub const DEFAULT_LINE_ITEMS_FIELD: &str = "items";

/// Conflict resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Remote collection replaces local.
    ServerWins,
    /// Local collection replaces remote.
    LocalWins,
    /// Newer `updatedAt` wins per record (default).
    #[default]
    LatestWins,
    /// Field-level combination per record.
    Merge,
    /// Differing records are handed back to the caller.
    Manual,
}

impl ConflictStrategy {
    /// The snake_case name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::LatestWins => "latest_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown strategy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown conflict strategy: {0}")]
pub struct ParseStrategyError(pub String);

impl FromStr for ConflictStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server_wins" => Ok(ConflictStrategy::ServerWins),
            "local_wins" => Ok(ConflictStrategy::LocalWins),
            "latest_wins" => Ok(ConflictStrategy::LatestWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

/// Two versions of the same record that the `manual` strategy did not resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// The shared record id
    pub id: Value,
    /// The local version
    pub local: Record,
    /// The remote version
    pub remote: Record,
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// The merged collection.
    ///
    /// For unresolved conflicts this holds the remote version as a placeholder.
    pub collection: Collection,
    /// Conflicts left for the caller (only produced by `manual`)
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    fn resolved(collection: Collection) -> Self {
        Self {
            collection,
            conflicts: Vec::new(),
        }
    }

    /// Whether every record was resolved automatically.
    pub fn is_resolved(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Produce the final collection, choosing a record for every conflict.
    pub fn resolve_with<F>(self, mut choose: F) -> Collection
    where
        F: FnMut(&Conflict) -> Record,
    {
        if self.conflicts.is_empty() {
            return self.collection;
        }

        let mut chosen: HashMap<String, Record> = self
            .conflicts
            .iter()
            .filter_map(|c| c.remote.key().map(|k| (k, choose(c))))
            .collect();

        self.collection
            .into_iter()
            .map(|record| match record.key().and_then(|k| chosen.remove(&k)) {
                Some(replacement) => replacement,
                None => record,
            })
            .collect()
    }
}

/// Merges collections under a strategy.
#[derive(Debug, Clone)]
pub struct Merger {
    strategy: ConflictStrategy,
    line_items_field: String,
}

impl Merger {
    /// Create a merger using the default line-items field.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            line_items_field: DEFAULT_LINE_ITEMS_FIELD.to_string(),
        }
    }

    /// Use a different field name for nested line items.
    pub fn with_line_items_field(mut self, field: impl Into<String>) -> Self {
        self.line_items_field = field.into();
        self
    }

    /// The configured strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Merge `local` into `remote`.
    pub fn merge(&self, local: &Collection, remote: &Collection) -> MergeOutcome {
        match self.strategy {
            ConflictStrategy::ServerWins => MergeOutcome::resolved(remote.clone()),
            ConflictStrategy::LocalWins => MergeOutcome::resolved(local.clone()),
            ConflictStrategy::LatestWins => {
                self.union_with(local, remote, |l, r| Resolution::Record(pick_latest(l, r)))
            }
            ConflictStrategy::Merge => self.union_with(local, remote, |l, r| {
                Resolution::Record(self.merge_fields(l, r))
            }),
            ConflictStrategy::Manual => self.union_with(local, remote, |l, r| {
                if l == r {
                    Resolution::Record(r.clone())
                } else {
                    Resolution::Conflict
                }
            }),
        }
    }

    /// Seed from remote, then fold every local record in by id.
    fn union_with<F>(&self, local: &Collection, remote: &Collection, resolve: F) -> MergeOutcome
    where
        F: Fn(&Record, &Record) -> Resolution,
    {
        let mut merged = IdIndex::from_collection(remote);
        let mut conflicts = Vec::new();

        for local_record in local {
            let Some(key) = local_record.key() else {
                merged.push_anonymous(local_record.clone());
                continue;
            };

            match merged.get(&key).cloned() {
                None => merged.insert(key, local_record.clone()),
                Some(remote_record) => match resolve(local_record, &remote_record) {
                    Resolution::Record(record) => merged.insert(key, record),
                    Resolution::Conflict => conflicts.push(Conflict {
                        id: remote_record.id().cloned().unwrap_or(Value::Null),
                        local: local_record.clone(),
                        remote: remote_record,
                    }),
                },
            }
        }

        MergeOutcome {
            collection: merged.into_collection(),
            conflicts,
        }
    }

    /// Field-level combination of two versions of one record.
    fn merge_fields(&self, local: &Record, remote: &Record) -> Record {
        let mut fields = remote.fields().clone();

        for (field, local_value) in local.fields() {
            let remote_value = remote.get(field);

            if field == UPDATED_AT_FIELD {
                let remote_millis = remote_value.map(timestamp_millis).unwrap_or(0);
                if timestamp_millis(local_value) > remote_millis {
                    fields.insert(field.clone(), local_value.clone());
                }
            } else if *field == self.line_items_field {
                if array_len(Some(local_value)) > array_len(remote_value) {
                    fields.insert(field.clone(), local_value.clone());
                }
            } else if !remote_value.is_some_and(is_truthy) && is_truthy(local_value) {
                fields.insert(field.clone(), local_value.clone());
            }
        }

        Record::new(fields)
    }
}

/// Merge with the default line-items field.
pub fn merge(local: &Collection, remote: &Collection, strategy: ConflictStrategy) -> MergeOutcome {
    Merger::new(strategy).merge(local, remote)
}

enum Resolution {
    Record(Record),
    Conflict,
}

fn pick_latest(local: &Record, remote: &Record) -> Record {
    if local.updated_at_millis() > remote.updated_at_millis() {
        local.clone()
    } else {
        remote.clone()
    }
}

fn array_len(value: Option<&Value>) -> usize {
    value.and_then(Value::as_array).map_or(0, Vec::len)
}

/// JavaScript-style truthiness: null, false, 0, NaN and "" are falsy.
/// Arrays and objects are truthy even when empty.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Ordered records indexed by id key.
///
/// Records without an id are kept in place but never matched.
struct IdIndex {
    slots: Vec<Record>,
    positions: HashMap<String, usize>,
}

impl IdIndex {
    fn from_collection(collection: &Collection) -> Self {
        let mut index = Self {
            slots: Vec::with_capacity(collection.len()),
            positions: HashMap::with_capacity(collection.len()),
        };
        for record in collection {
            match record.key() {
                Some(key) => index.insert(key, record.clone()),
                None => index.push_anonymous(record.clone()),
            }
        }
        index
    }

    fn get(&self, key: &str) -> Option<&Record> {
        self.positions.get(key).map(|&i| &self.slots[i])
    }

    /// Replace in place when the key exists, otherwise append.
    fn insert(&mut self, key: String, record: Record) {
        match self.positions.get(&key) {
            Some(&i) => self.slots[i] = record,
            None => {
                self.positions.insert(key, self.slots.len());
                self.slots.push(record);
            }
        }
    }

    fn push_anonymous(&mut self, record: Record) {
        self.slots.push(record);
    }

    fn into_collection(self) -> Collection {
        self.slots.into()
    }
}
