//! Ingestion mutation hooks

use crate::seed::SeedRow;
use std::collections::BTreeMap;

/// Hook applied once to every row right after it is read
///
/// Implemented for plain closures, so `|row: &mut SeedRow| { ... }` works.
pub trait IngestMutator: Send + Sync {
    fn mutate(&self, row: &mut SeedRow);
}

impl<F> IngestMutator for F
where
    F: Fn(&mut SeedRow) + Send + Sync,
{
    fn mutate(&self, row: &mut SeedRow) {
        self(row)
    }
}

/// Leaves rows untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMutator;

impl IngestMutator for NoopMutator {
    fn mutate(&self, _row: &mut SeedRow) {}
}

/// Stamps a fixed set of extra values onto every row
#[derive(Debug, Clone, Default)]
pub struct StaticExtraMutator {
    values: BTreeMap<String, String>,
}

impl StaticExtraMutator {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

impl IngestMutator for StaticExtraMutator {
    fn mutate(&self, row: &mut SeedRow) {
        for (key, value) in &self.values {
            row.extra
                .insert(key.clone(), serde_json::Value::String(value.clone()));
        }
    }
}
