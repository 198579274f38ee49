//! Storage traits and error types
//!
//! This module defines the trait interface for response log backends and
//! associated error types.

use crate::storage::FetchOutcome;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(String),

    #[error("Failed to decode record: {0}")]
    Decode(String),

    #[error("Corrupt record on line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Append-only store of fetch outcomes
///
/// The log is the only durable record of progress: the dedup index of the next
/// run is rebuilt from it, so an append must be complete and durable before it
/// returns, and a crash may only ever leave a prefix of whole records behind.
pub trait ResponseLog: Send {
    /// Durably appends one outcome
    fn append(&mut self, outcome: &FetchOutcome) -> StorageResult<()>;

    /// Reads every outcome in append order
    ///
    /// A log that does not exist yet is empty, not an error.
    fn load_all(&self) -> StorageResult<Vec<FetchOutcome>>;
}
