//! State module for tracking run progress
//!
//! This module provides the mutable state owned by the scheduler for a single run.
//!
//! # Components
//!
//! - `RunPhase`: Where the scheduler state machine currently is (running, sleeping, done, aborted)
//! - `RunState`: Cursor, end bound, sleep deadline and the failure/back-off counters

mod run_phase;
mod run_state;

// Re-export main types
pub use run_phase::RunPhase;
pub use run_state::RunState;
