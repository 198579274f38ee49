//! Statistics derived from the seed file and the response log
//!
//! This module provides functionality for measuring how far a harvest has
//! progressed without fetching anything.

use crate::config::Config;
use crate::seed::{permute, DedupIndex, DedupKey, NoopMutator, SeedLayout, SeedRow, SeedStore};
use crate::storage::{FetchOutcome, FileResponseLog, ResponseLog};
use crate::HarvestError;
use std::collections::HashMap;
use std::path::Path;

/// Harvest progress summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestStatistics {
    /// Number of seed rows
    pub total_rows: usize,

    /// Number of outcomes in the response log
    pub logged_outcomes: usize,

    /// Number of distinct keys among the logged outcomes
    pub distinct_keys: usize,

    /// Logged outcomes whose key appeared earlier in the log
    pub duplicate_outcomes: usize,

    /// Rows in the configured range without a logged outcome
    pub remaining_in_range: usize,

    /// Size of the configured range
    pub range_len: usize,

    /// The range covers an unseeded shuffle, so its membership differs per run
    pub range_is_estimate: bool,
}

impl HarvestStatistics {
    /// Computes statistics from rows, prior outcomes and the configured range
    pub fn compute(
        rows: &[SeedRow],
        outcomes: &[FetchOutcome],
        key_columns: &[String],
        start: usize,
        end: usize,
    ) -> Self {
        let mut seen: HashMap<DedupKey, usize> = HashMap::new();
        for outcome in outcomes {
            if let Some(key) = DedupKey::from_fields(&outcome.seed.fields, key_columns) {
                *seen.entry(key).or_default() += 1;
            }
        }
        let duplicate_outcomes = seen.values().map(|count| count - 1).sum();

        let done = DedupIndex::build(outcomes, key_columns);
        let end = end.min(rows.len());
        let start = start.min(end);
        let remaining_in_range = rows[start..end]
            .iter()
            .filter(|row| !done.contains(row))
            .count();

        Self {
            total_rows: rows.len(),
            logged_outcomes: outcomes.len(),
            distinct_keys: seen.len(),
            duplicate_outcomes,
            remaining_in_range,
            range_len: end - start,
            range_is_estimate: false,
        }
    }
}

/// Loads statistics for a configured harvest
///
/// The range is applied to the same row order a run would use. With an unseeded
/// shuffle that order is only known once the run starts, so a partial range is
/// counted against one sample permutation and flagged as an estimate.
pub fn load_statistics(config: &Config) -> Result<HarvestStatistics, HarvestError> {
    let layout = SeedLayout::from_config(&config.seed)?;
    let store = SeedStore::load(Path::new(&config.seed.path), layout, &NoopMutator)?;
    let (_, mut rows) = store.into_parts();

    if config.run.shuffle {
        permute(&mut rows, config.run.shuffle_seed);
    }

    let log = FileResponseLog::open(Path::new(&config.output.response_log_path))?;
    let outcomes = log.load_all()?;

    let end = config.run.end.unwrap_or(rows.len());
    let mut stats = HarvestStatistics::compute(
        &rows,
        &outcomes,
        &config.seed.key_columns,
        config.run.start,
        end,
    );
    stats.range_is_estimate = config.run.shuffle
        && config.run.shuffle_seed.is_none()
        && stats.range_len < stats.total_rows;
    Ok(stats)
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &HarvestStatistics) {
    println!("=== Harvest Statistics ===\n");

    println!("Overview:");
    println!("  Seed rows: {}", stats.total_rows);
    println!("  Logged outcomes: {}", stats.logged_outcomes);
    println!("  Distinct keys fetched: {}", stats.distinct_keys);
    if stats.duplicate_outcomes > 0 {
        println!("  Duplicate log entries: {}", stats.duplicate_outcomes);
    }
    println!();

    let done = stats.range_len - stats.remaining_in_range;
    let percentage = if stats.range_len > 0 {
        (done as f64 / stats.range_len as f64) * 100.0
    } else {
        100.0
    };

    println!(
        "Progress: {:.1}% ({} / {} rows in range, {} remaining)",
        percentage, done, stats.range_len, stats.remaining_in_range
    );
    if stats.range_is_estimate {
        println!("  (estimate: the range covers an unseeded shuffle)");
    }
}
