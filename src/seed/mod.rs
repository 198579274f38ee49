//! Seed module for loading and indexing the records to fetch
//!
//! This module contains:
//! - Parsing the delimited seed file into ordinal-stamped rows
//! - The ingestion mutation hook applied once per row
//! - Optional permutation of the row sequence
//! - The dedup index built from previously logged outcomes

mod dedup;
mod mutator;
mod store;

pub use dedup::{DedupIndex, DedupKey};
pub use mutator::{IngestMutator, NoopMutator, StaticExtraMutator};
pub use store::{permute, SeedFormat, SeedLayout, SeedRow, SeedStore};

use thiserror::Error;

/// Errors raised while reading the seed source
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Unsupported seed format: '{0}' (expected csv, tsv or delimited)")]
    UnsupportedFormat(String),

    #[error("Seed format '{0}' requires an explicit separator")]
    MissingSeparator(String),

    #[error("Seed source has no header line")]
    MissingHeader,

    #[error("Seed line {line} has no column {index} for field '{column}'")]
    MissingColumn {
        line: usize,
        column: String,
        index: usize,
    },

    #[error("Failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for seed operations
pub type SeedResult<T> = Result<T, SeedError>;
