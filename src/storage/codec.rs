//! Line codecs for the response log

use crate::storage::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a record as a single line and back
///
/// An encoded line must not contain a newline.
pub trait RecordCodec<T>: Send + Sync {
    fn encode(&self, record: &T) -> StorageResult<String>;
    fn decode(&self, line: &str) -> StorageResult<T>;
}

/// Compact JSON, one object per line
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl<T> RecordCodec<T> for JsonLinesCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, record: &T) -> StorageResult<String> {
        serde_json::to_string(record).map_err(|e| StorageError::Encode(e.to_string()))
    }

    fn decode(&self, line: &str) -> StorageResult<T> {
        serde_json::from_str(line).map_err(|e| StorageError::Decode(e.to_string()))
    }
}
