//! Dedup index over previously fetched records
//!
//! Two rows are the same record iff every key column holds the same string.
//! Non-key columns are ignored, so a row whose other fields changed between
//! runs is still considered done.

use crate::seed::SeedRow;
use crate::storage::FetchOutcome;
use indexmap::IndexMap;
use std::collections::HashSet;

/// The key-column values of a row, in key-column order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(Vec<String>);

impl DedupKey {
    /// Builds a key from a field map
    ///
    /// Returns `None` when any key column is missing: such a record can never match.
    pub fn from_fields(fields: &IndexMap<String, String>, key_columns: &[String]) -> Option<Self> {
        key_columns
            .iter()
            .map(|column| fields.get(column).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

/// Set of keys that already have a logged outcome
#[derive(Debug, Clone)]
pub struct DedupIndex {
    key_columns: Vec<String>,
    keys: HashSet<DedupKey>,
}

impl DedupIndex {
    /// Creates an empty index
    pub fn new(key_columns: Vec<String>) -> Self {
        Self {
            key_columns,
            keys: HashSet::new(),
        }
    }

    /// Builds the index from the outcomes of earlier runs
    pub fn build(prior: &[FetchOutcome], key_columns: &[String]) -> Self {
        let mut index = Self::new(key_columns.to_vec());
        let mut unkeyed = 0usize;

        for outcome in prior {
            match DedupKey::from_fields(&outcome.seed.fields, key_columns) {
                Some(key) => {
                    index.keys.insert(key);
                }
                None => unkeyed += 1,
            }
        }

        if unkeyed > 0 {
            tracing::warn!(
                "{} logged outcomes lack a key column ({:?}) and cannot be deduplicated",
                unkeyed,
                key_columns
            );
        }

        index
    }

    /// Returns true if an outcome for this row's key was already recorded
    pub fn contains(&self, row: &SeedRow) -> bool {
        DedupKey::from_fields(&row.fields, &self.key_columns)
            .map(|key| self.keys.contains(&key))
            .unwrap_or(false)
    }

    /// Marks a row as done; returns false if it already was
    pub fn insert(&mut self, row: &SeedRow) -> bool {
        match DedupKey::from_fields(&row.fields, &self.key_columns) {
            Some(key) => self.keys.insert(key),
            None => false,
        }
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
