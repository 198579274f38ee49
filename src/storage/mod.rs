//! Storage module for persisting fetch outcomes
//!
//! This module handles the append-only response log, including:
//! - The `ResponseLog` trait the scheduler writes through
//! - A pluggable line codec (`RecordCodec`), JSON lines by default
//! - A file-backed log that flushes and syncs every record
//! - An in-memory log for embedding and tests

mod codec;
mod file_log;
mod memory;
mod traits;

pub use codec::{JsonLinesCodec, RecordCodec};
pub use file_log::FileResponseLog;
pub use memory::MemoryResponseLog;
pub use traits::{ResponseLog, StorageError, StorageResult};

use crate::seed::SeedRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A successful fetch, as persisted in the response log
///
/// Embeds the full originating row so the dedup key, the ordinal and the raw
/// seed line can be recovered without re-reading the seed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// The row the fetch was made for
    pub seed: SeedRow,

    /// The transport payload, stored as returned
    pub payload: serde_json::Value,

    /// When the fetch completed
    pub fetched_at: DateTime<Utc>,
}

impl FetchOutcome {
    /// Creates an outcome stamped with the current time
    pub fn new(seed: SeedRow, payload: serde_json::Value) -> Self {
        Self {
            seed,
            payload,
            fetched_at: Utc::now(),
        }
    }

    /// Ordinal of the originating row
    pub fn ordinal(&self) -> u64 {
        self.seed.id
    }
}
