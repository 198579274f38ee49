use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for Sumi-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run: RunConfig,
    pub seed: SeedConfig,
    pub output: OutputConfig,
    pub transport: TransportConfig,
    #[serde(default)]
    pub refine: RefineConfig,
}

/// What happens to a record whose response was discarded by a back-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DiscardedRecord {
    /// Keep the cursor on the record and fetch it again once the pause ends
    #[default]
    Retry,

    /// Move past the record; it stays unlogged and is picked up by the next run
    Skip,
}

/// Scheduling and failure-budget configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Cosmetic label attached to log lines
    pub label: String,

    /// Fixed interval between scheduler ticks (milliseconds)
    #[serde(rename = "tick-interval-ms")]
    pub tick_interval_ms: u64,

    /// Pause applied when the back-off policy fires (minutes)
    #[serde(rename = "back-off-minutes")]
    pub back_off_minutes: f64,

    /// Shuffle the seed rows before scheduling
    pub shuffle: bool,

    /// Seed for a reproducible shuffle
    #[serde(rename = "shuffle-seed", default)]
    pub shuffle_seed: Option<u64>,

    /// Consecutive failures after which a single record is abandoned
    #[serde(rename = "max-record-fail-count")]
    pub max_record_fail_count: u32,

    /// Consecutive failures after which the whole run is aborted
    #[serde(rename = "max-fail-count")]
    pub max_fail_count: u32,

    /// Extra pause after a failure, in tick intervals
    #[serde(rename = "sleep-intervals-after-fail")]
    pub sleep_intervals_after_fail: u32,

    /// Drop the response that triggered a back-off instead of logging it
    #[serde(rename = "discard-on-back-off")]
    pub discard_on_back_off: bool,

    /// Cursor behaviour for a discarded record
    #[serde(rename = "discarded-record", default)]
    pub discarded_record: DiscardedRecord,

    /// Reassemble seed rows and fetched fields when the run ends
    pub refine: bool,

    /// First row (0-based) to schedule
    #[serde(default)]
    pub start: usize,

    /// Exclusive end bound; defaults to the number of seed rows
    #[serde(default)]
    pub end: Option<usize>,
}

impl RunConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Back-off pause; saturates for values validation would reject
    pub fn back_off_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.back_off_minutes * 60.0).unwrap_or(Duration::MAX)
    }
}

/// Seed source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SeedConfig {
    /// Path to the seed file
    pub path: String,

    /// Declared seed format ("csv", "tsv" or "delimited")
    pub format: String,

    /// Field separator; csv and tsv provide a default
    #[serde(default)]
    pub separator: Option<String>,

    /// Record terminator
    #[serde(rename = "line-terminator")]
    pub line_terminator: String,

    /// Columns whose values identify a record
    #[serde(rename = "key-columns")]
    pub key_columns: Vec<String>,

    /// Field name -> 0-based column index, in declaration order
    pub columns: IndexMap<String, usize>,

    /// Constant extra fields stamped onto every row
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the append-only response log
    #[serde(rename = "response-log-path")]
    pub response_log_path: String,

    /// Path to the reassembled output file
    #[serde(rename = "refined-path")]
    pub refined_path: String,
}

/// HTTP transport configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Request URL with `{field}` placeholders
    #[serde(rename = "url-template")]
    pub url_template: String,

    /// "GET" or "POST"
    #[serde(default = "default_method")]
    pub method: String,

    /// Request timeout (seconds)
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent header value
    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Statuses passed to the back-off policy instead of counting as failures
    #[serde(rename = "back-off-statuses", default = "default_back_off_statuses")]
    pub back_off_statuses: Vec<u16>,

    /// Back off after this many fetches (0 disables)
    #[serde(rename = "back-off-every", default)]
    pub back_off_every: u32,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("sumi-harvest/{}", env!("CARGO_PKG_VERSION"))
}

fn default_back_off_statuses() -> Vec<u16> {
    vec![429]
}

/// Reassembly configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefineConfig {
    /// New output columns, in order
    #[serde(default)]
    pub fields: Vec<RefineField>,
}

/// A single derived output column
#[derive(Debug, Clone, Deserialize)]
pub struct RefineField {
    /// Column name in the refined header
    pub name: String,

    /// JSON pointer into the stored payload
    pub pointer: String,
}
