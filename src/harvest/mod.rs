//! Harvest module for scheduling and performing the fetches
//!
//! This module contains the core harvesting logic, including:
//! - The remote transport and its HTTP implementation
//! - Failure and rate-limit pacing
//! - The single-flight tick scheduler
//! - Reassembly of seed rows with the fetched fields
//! - Overall run coordination

mod backoff;
mod coordinator;
mod refiner;
mod scheduler;
mod transport;

pub use backoff::{
    BackoffController, BackoffPolicy, BackoffSettings, FailureVerdict, NeverBackOff,
    StatusBackOffPolicy, SuccessVerdict,
};
pub use coordinator::{
    refine_from_log, run_harvest, Harvester, HarvesterBuilder, RunReport, RunStatus,
};
pub use refiner::{render, PointerRefiner, RefineError, RefineFn, RefineTarget, Refiner};
pub use scheduler::{RunTally, Scheduler, TickOutcome};
pub use transport::{build_http_client, FetchError, HttpTransport, Transport};
