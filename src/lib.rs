//! Sumi-Harvest: a resumable, rate-respecting record fetcher
//!
//! This crate walks an ordered list of seed records, fetches remote data for each
//! one through a pluggable transport, persists every outcome to an append-only log
//! so an interrupted run resumes where it stopped, and finally reassembles the
//! seed rows with the newly fetched fields into an augmented file.

pub mod config;
pub mod harvest;
pub mod output;
pub mod seed;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Sumi-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Seed error: {0}")]
    Seed(#[from] seed::SeedError),

    #[error("Response log write failed: {0}")]
    Persistence(#[from] storage::StorageError),

    #[error("Reassembly failed: {0}")]
    Refine(#[from] harvest::RefineError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Run aborted after {failures} consecutive fetch failures")]
    RunAborted { failures: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Sumi-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use harvest::{Harvester, RunReport, RunStatus};
pub use seed::{DedupIndex, DedupKey, SeedRow};
pub use state::{RunPhase, RunState};
pub use storage::{FetchOutcome, ResponseLog};
