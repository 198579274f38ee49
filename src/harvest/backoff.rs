//! Failure and rate-limit pacing
//!
//! The controller decides, after each fetch attempt, whether the run pauses,
//! retries the record, gives the record up, or stops altogether. It never
//! sleeps itself: it only moves the sleep deadline in `RunState`.

use crate::config::{DiscardedRecord, RunConfig, TransportConfig};
use crate::seed::SeedRow;
use crate::state::RunState;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Detects rate limiting in a successful response
///
/// Implemented for closures `Fn(&Value, &SeedRow, u32) -> bool`.
pub trait BackoffPolicy: Send + Sync {
    /// `fetches_since_back_off` includes the fetch that produced `payload`
    fn should_back_off(&self, payload: &Value, seed: &SeedRow, fetches_since_back_off: u32)
        -> bool;
}

impl<F> BackoffPolicy for F
where
    F: Fn(&Value, &SeedRow, u32) -> bool + Send + Sync,
{
    fn should_back_off(&self, payload: &Value, seed: &SeedRow, fetches_since_back_off: u32) -> bool {
        self(payload, seed, fetches_since_back_off)
    }
}

/// Never pauses
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverBackOff;

impl BackoffPolicy for NeverBackOff {
    fn should_back_off(&self, _payload: &Value, _seed: &SeedRow, _fetches: u32) -> bool {
        false
    }
}

/// Backs off on rate-limit statuses and, optionally, every N fetches
///
/// Reads the `status` member of the payload produced by `HttpTransport`.
#[derive(Debug, Clone, Default)]
pub struct StatusBackOffPolicy {
    statuses: Vec<u16>,
    every: u32,
}

impl StatusBackOffPolicy {
    pub fn new(statuses: Vec<u16>, every: u32) -> Self {
        Self { statuses, every }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.back_off_statuses.clone(), config.back_off_every)
    }
}

impl BackoffPolicy for StatusBackOffPolicy {
    fn should_back_off(&self, payload: &Value, _seed: &SeedRow, fetches_since_back_off: u32) -> bool {
        let status_hit = payload
            .get("status")
            .and_then(Value::as_u64)
            .map(|status| self.statuses.iter().any(|&s| u64::from(s) == status))
            .unwrap_or(false);

        status_hit || (self.every > 0 && fetches_since_back_off >= self.every)
    }
}

/// Limits and pauses taken from the run configuration
#[derive(Debug, Clone)]
pub struct BackoffSettings {
    pub tick_interval: Duration,
    pub back_off: Duration,
    pub max_record_fail_count: u32,
    pub max_fail_count: u32,
    pub sleep_intervals_after_fail: u32,
    pub discard_on_back_off: bool,
    pub discarded_record: DiscardedRecord,
}

impl From<&RunConfig> for BackoffSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            back_off: config.back_off_duration(),
            max_record_fail_count: config.max_record_fail_count,
            max_fail_count: config.max_fail_count,
            sleep_intervals_after_fail: config.sleep_intervals_after_fail,
            discard_on_back_off: config.discard_on_back_off,
            discarded_record: config.discarded_record,
        }
    }
}

/// What the scheduler does after a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Try the same record again on a later tick
    Retry,

    /// The record ran out of attempts; the cursor has moved past it
    Abandon,

    /// The run-wide budget is spent
    Abort,
}

/// What the scheduler does with a successful response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessVerdict {
    /// Persist it and carry on
    Keep,

    /// Persist it, then pause for the back-off duration
    KeepAndPause,

    /// Drop it and pause; the cursor was moved only under `DiscardedRecord::Skip`
    Discard,
}

/// Applies failure-driven and policy-driven pauses to the run state
pub struct BackoffController {
    settings: BackoffSettings,
    policy: Box<dyn BackoffPolicy>,
}

impl BackoffController {
    pub fn new(settings: BackoffSettings, policy: Box<dyn BackoffPolicy>) -> Self {
        Self { settings, policy }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// True once consecutive failures reached the run-wide limit
    pub fn should_abort(&self, state: &RunState) -> bool {
        state.run_fail_count >= self.settings.max_fail_count
    }

    /// Records a failed attempt for the row at the cursor
    pub fn on_failure(&self, state: &mut RunState, now: Instant) -> FailureVerdict {
        state.record_fail_count += 1;
        state.run_fail_count += 1;
        state.sleep_for(
            now,
            self.settings
                .tick_interval
                .saturating_mul(self.settings.sleep_intervals_after_fail),
        );

        let abandoned = state.record_fail_count >= self.settings.max_record_fail_count;
        if abandoned {
            state.advance();
        }

        if self.should_abort(state) {
            FailureVerdict::Abort
        } else if abandoned {
            FailureVerdict::Abandon
        } else {
            FailureVerdict::Retry
        }
    }

    /// Records a successful response and consults the back-off policy
    pub fn on_success(
        &self,
        state: &mut RunState,
        now: Instant,
        payload: &Value,
        seed: &SeedRow,
    ) -> SuccessVerdict {
        state.record_fail_count = 0;
        state.run_fail_count = 0;
        state.fetches_since_back_off += 1;

        if !self
            .policy
            .should_back_off(payload, seed, state.fetches_since_back_off)
        {
            state.sleep_until = None;
            return SuccessVerdict::Keep;
        }

        state.fetches_since_back_off = 0;
        state.sleep_for(now, self.settings.back_off);

        if !self.settings.discard_on_back_off {
            return SuccessVerdict::KeepAndPause;
        }

        if self.settings.discarded_record == DiscardedRecord::Skip {
            state.advance();
        }
        SuccessVerdict::Discard
    }
}
