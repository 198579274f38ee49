use crate::state::RunPhase;
use std::time::Duration;
use tokio::time::Instant;

/// Deadline used when a pause would overflow the clock (roughly 30 years)
const FAR_FUTURE_SECS: u64 = 86400 * 365 * 30;

/// Mutable state of a single harvest run
///
/// Owned by the scheduler and only touched inside a tick. Nothing here is
/// persisted; a resumed run rebuilds its progress from the response log.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Index into the (possibly shuffled) row sequence
    pub cursor: usize,

    /// Exclusive end bound of the cursor
    pub end: usize,

    /// Ticks before this instant are no-ops
    pub sleep_until: Option<Instant>,

    /// Consecutive failures of the row at the cursor
    pub record_fail_count: u32,

    /// Consecutive failures across rows
    pub run_fail_count: u32,

    /// Successful fetches since the last back-off
    pub fetches_since_back_off: u32,

    /// Current state machine phase
    pub phase: RunPhase,
}

impl RunState {
    /// Creates a state positioned at `start`, clamped to `end`
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            cursor: start.min(end),
            end,
            sleep_until: None,
            record_fail_count: 0,
            run_fail_count: 0,
            fetches_since_back_off: 0,
            phase: RunPhase::Running,
        }
    }

    /// True once the cursor reached the end bound
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.end
    }

    /// True while a sleep deadline lies in the future
    pub fn is_sleeping(&self, now: Instant) -> bool {
        matches!(self.sleep_until, Some(until) if now < until)
    }

    /// Pauses ticks until `now + duration`; a zero duration clears the deadline
    pub fn sleep_for(&mut self, now: Instant, duration: Duration) {
        self.sleep_until = if duration.is_zero() {
            None
        } else {
            Some(
                now.checked_add(duration)
                    .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS)),
            )
        };
    }

    /// Moves to the next row and forgets the previous row's failures
    pub fn advance(&mut self) {
        self.cursor += 1;
        self.record_fail_count = 0;
    }

    /// Rows left between cursor and end
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.cursor)
    }
}
