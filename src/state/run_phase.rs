//! Scheduler phase definitions
//!
//! This module defines the states of the scheduler state machine.

use std::fmt;

/// Represents the current phase of a harvest run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    // ===== Active States =====
    /// Ticks perform work
    Running,

    /// A sleep deadline is pending; ticks are no-ops until it passes
    Sleeping,

    // ===== Terminal States =====
    /// Every row in range was handled
    Done,

    /// The run-wide failure budget ran out
    Aborted,
}

impl RunPhase {
    /// Returns true once the scheduler has stopped ticking
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
