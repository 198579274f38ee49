//! In-memory response log

use crate::storage::traits::{ResponseLog, StorageResult};
use crate::storage::FetchOutcome;
use std::sync::{Arc, Mutex, PoisonError};

/// Response log kept in memory
///
/// Clones share the same records, so a handle kept by the caller sees what a
/// scheduler appended after the log was moved into it.
#[derive(Debug, Clone, Default)]
pub struct MemoryResponseLog {
    records: Arc<Mutex<Vec<FetchOutcome>>>,
}

impl MemoryResponseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log that already holds `records`
    pub fn with_records(records: Vec<FetchOutcome>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
        }
    }

    /// Snapshot of the stored records
    pub fn records(&self) -> Vec<FetchOutcome> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseLog for MemoryResponseLog {
    fn append(&mut self, outcome: &FetchOutcome) -> StorageResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome.clone());
        Ok(())
    }

    fn load_all(&self) -> StorageResult<Vec<FetchOutcome>> {
        Ok(self.records())
    }
}
