//! Harvest coordinator - run wiring and the tick loop
//!
//! This module turns a validated configuration into a running harvest:
//! - Loading and optionally shuffling the seed rows
//! - Rebuilding progress from the response log
//! - Wiring the configured (or injected) collaborators into a `Scheduler`
//! - Driving ticks from a fixed-interval timer until the run stops
//! - Reassembly over an existing log without fetching

use crate::config::Config;
use crate::harvest::backoff::{BackoffController, BackoffPolicy, BackoffSettings, StatusBackOffPolicy};
use crate::harvest::refiner::{PointerRefiner, RefineFn, RefineTarget, Refiner};
use crate::harvest::scheduler::{RunTally, Scheduler, TickOutcome};
use crate::harvest::transport::{HttpTransport, Transport};
use crate::seed::{
    permute, DedupIndex, IngestMutator, NoopMutator, SeedLayout, SeedStore, StaticExtraMutator,
};
use crate::state::RunState;
use crate::storage::{FileResponseLog, ResponseLog};
use crate::HarvestError;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every row in range was fetched, skipped or abandoned
    Completed,

    /// The run-wide failure budget was spent
    Aborted,

    /// Stopped from outside between ticks; no reassembly ran
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,

    /// Outcomes appended to the log in this run
    pub fetched: usize,

    /// Rows skipped because their key was already logged
    pub skipped: usize,

    /// Rows given up after too many consecutive failures
    pub abandoned: usize,

    /// Back-off pauses triggered by the policy
    pub backed_off: usize,

    /// Responses dropped because they triggered a back-off
    pub discarded: usize,

    /// Rows between the cursor and the end bound when the run stopped
    pub remaining: usize,

    /// Consecutive failures when the run stopped
    pub consecutive_failures: u32,

    /// Lines written by reassembly, if it ran
    pub refined_rows: Option<usize>,
}

impl RunReport {
    pub(crate) fn new(
        status: RunStatus,
        tally: &RunTally,
        state: &RunState,
        refined_rows: Option<usize>,
    ) -> Self {
        Self {
            status,
            fetched: tally.fetched,
            skipped: tally.skipped,
            abandoned: tally.abandoned,
            backed_off: tally.back_offs,
            discarded: tally.discarded,
            remaining: state.remaining(),
            consecutive_failures: state.run_fail_count,
            refined_rows,
        }
    }

    /// Turns an aborted run into `HarvestError::RunAborted`
    pub fn into_result(self) -> Result<Self, HarvestError> {
        match self.status {
            RunStatus::Aborted => Err(HarvestError::RunAborted {
                failures: self.consecutive_failures,
            }),
            _ => Ok(self),
        }
    }
}

/// Builds a `Harvester`, with any collaborator replaceable
///
/// Collaborators not supplied are built from the configuration.
pub struct HarvesterBuilder {
    config: Config,
    transport: Option<Box<dyn Transport>>,
    back_off_policy: Option<Box<dyn BackoffPolicy>>,
    mutator: Option<Box<dyn IngestMutator>>,
    refine_fn: Option<Box<dyn RefineFn>>,
    response_log: Option<Box<dyn ResponseLog>>,
}

impl HarvesterBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            back_off_policy: None,
            mutator: None,
            refine_fn: None,
            response_log: None,
        }
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn back_off_policy(mut self, policy: impl BackoffPolicy + 'static) -> Self {
        self.back_off_policy = Some(Box::new(policy));
        self
    }

    pub fn mutator(mut self, mutator: impl IngestMutator + 'static) -> Self {
        self.mutator = Some(Box::new(mutator));
        self
    }

    pub fn refine_fn(mut self, refine: impl RefineFn + 'static) -> Self {
        self.refine_fn = Some(Box::new(refine));
        self
    }

    pub fn response_log(mut self, log: impl ResponseLog + 'static) -> Self {
        self.response_log = Some(Box::new(log));
        self
    }

    /// Loads the seeds and the log and assembles the scheduler
    ///
    /// Nothing touches the network here.
    pub fn build(self) -> Result<Harvester, HarvestError> {
        let config = self.config;

        let mutator = self.mutator.unwrap_or_else(|| default_mutator(&config));
        let store = load_seeds(&config, mutator.as_ref())?;
        let layout = store.layout().clone();
        let (header, mut rows) = store.into_parts();

        if config.run.shuffle {
            permute(&mut rows, config.run.shuffle_seed);
            tracing::info!("Shuffled {} seed rows", rows.len());
        }

        let log = match self.response_log {
            Some(log) => log,
            None => Box::new(FileResponseLog::open(Path::new(
                &config.output.response_log_path,
            ))?),
        };
        let prior = log.load_all()?;
        let done = DedupIndex::build(&prior, &config.seed.key_columns);
        tracing::info!(
            "Response log holds {} outcomes ({} distinct keys)",
            prior.len(),
            done.len()
        );

        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(HttpTransport::new(&config.transport)?),
        };
        let policy = self
            .back_off_policy
            .unwrap_or_else(|| Box::new(StatusBackOffPolicy::from_config(&config.transport)));

        let end = config.run.end.unwrap_or(rows.len());
        let backoff = BackoffController::new(BackoffSettings::from(&config.run), policy);
        let mut scheduler = Scheduler::new(
            config.run.label.clone(),
            rows,
            config.run.start,
            end,
            done,
            log,
            transport,
            backoff,
        );

        if config.run.refine {
            let refine = self
                .refine_fn
                .unwrap_or_else(|| Box::new(PointerRefiner::new(config.refine.fields.clone())));
            let mut refiner = Refiner::new(refine, refine_target(&config, header, &layout));
            refiner.preload(prior);
            scheduler = scheduler.with_refiner(refiner);
        }

        Ok(Harvester {
            scheduler,
            tick_interval: config.run.tick_interval(),
        })
    }
}

/// Drives a scheduler from a fixed-interval timer
pub struct Harvester {
    scheduler: Scheduler,
    tick_interval: Duration,
}

impl Harvester {
    pub fn builder(config: Config) -> HarvesterBuilder {
        HarvesterBuilder::new(config)
    }

    /// Builds a harvester with every collaborator taken from the configuration
    pub fn from_config(config: Config) -> Result<Self, HarvestError> {
        HarvesterBuilder::new(config).build()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Runs until the range is handled, the run aborts, or Ctrl-C is pressed
    pub async fn run(&mut self) -> Result<RunReport, HarvestError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until the range is handled, the run aborts, or `shutdown` resolves
    ///
    /// `shutdown` is only checked between ticks; an in-flight fetch always
    /// completes first.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<RunReport, HarvestError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.tick_interval);
        // a slow fetch swallows the ticks it overlaps instead of queueing them
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = std::time::Instant::now();
        let mut last_reported = 0;
        tracing::info!(
            "[{}] starting at row {} of {}",
            self.scheduler.label(),
            self.scheduler.state().cursor,
            self.scheduler.state().end
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return Ok(self.scheduler.interrupt()),
                _ = ticker.tick() => {}
            }

            loop {
                match self.scheduler.tick(Instant::now()).await? {
                    TickOutcome::Finished(report) => {
                        log_report(self.scheduler.label(), &report, started.elapsed());
                        return Ok(report);
                    }
                    outcome if outcome.reenters() => continue,
                    _ => break,
                }
            }

            let fetched = self.scheduler.tally().fetched;
            if fetched >= last_reported + 10 {
                last_reported = fetched - fetched % 10;
                let rate = fetched as f64 / started.elapsed().as_secs_f64();
                tracing::info!(
                    "[{}] Progress: {} fetched, {} remaining, {:.2} fetches/sec",
                    self.scheduler.label(),
                    fetched,
                    self.scheduler.state().remaining(),
                    rate
                );
            }
        }
    }
}

/// Runs a complete harvest from configuration
pub async fn run_harvest(config: Config) -> Result<RunReport, HarvestError> {
    let mut harvester = Harvester::from_config(config)?;
    harvester.run().await
}

/// Reassembles the existing response log without fetching anything
///
/// Returns the number of data lines written.
pub fn refine_from_log(config: &Config) -> Result<usize, HarvestError> {
    let store = load_seeds(config, default_mutator(config).as_ref())?;
    let layout = store.layout().clone();
    let (header, _) = store.into_parts();

    let log = FileResponseLog::open(Path::new(&config.output.response_log_path))?;
    let outcomes = log.load_all()?;
    tracing::info!("Refining {} logged outcomes", outcomes.len());

    let mut refiner = Refiner::new(
        Box::new(PointerRefiner::new(config.refine.fields.clone())),
        refine_target(config, header, &layout),
    );
    refiner.preload(outcomes);
    Ok(refiner.run()?)
}

fn default_mutator(config: &Config) -> Box<dyn IngestMutator> {
    if config.seed.extra.is_empty() {
        Box::new(NoopMutator)
    } else {
        Box::new(StaticExtraMutator::new(config.seed.extra.clone()))
    }
}

fn load_seeds(config: &Config, mutator: &dyn IngestMutator) -> Result<SeedStore, HarvestError> {
    let layout = SeedLayout::from_config(&config.seed)?;
    Ok(SeedStore::load(Path::new(&config.seed.path), layout, mutator)?)
}

fn refine_target(config: &Config, header: String, layout: &SeedLayout) -> RefineTarget {
    RefineTarget {
        header,
        separator: layout.separator.clone(),
        line_terminator: layout.line_terminator.clone(),
        path: PathBuf::from(&config.output.refined_path),
        restore_order: config.run.shuffle,
    }
}

fn log_report(label: &str, report: &RunReport, elapsed: Duration) {
    tracing::info!(
        "[{}] run {} in {:?}: {} fetched, {} skipped, {} abandoned, {} back-offs ({} discarded), {} remaining",
        label,
        report.status,
        elapsed,
        report.fetched,
        report.skipped,
        report.abandoned,
        report.backed_off,
        report.discarded,
        report.remaining
    );
    if let Some(rows) = report.refined_rows {
        tracing::info!("[{}] reassembled {} rows", label, rows);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Unable to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Interrupt received, stopping before the next tick");
}
