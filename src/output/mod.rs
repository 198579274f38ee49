//! Output module for reporting on harvest progress
//!
//! Reassembly of the refined file lives with the harvest itself; this module
//! only summarises what the seed file and the response log say.

pub mod stats;

pub use stats::{load_statistics, print_statistics, HarvestStatistics};
