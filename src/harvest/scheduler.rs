//! Single-flight tick scheduler
//!
//! This module drives a run one tick at a time:
//! - Stops with `Done` once the cursor reaches the end bound
//! - Stops with `Aborted` once the run-wide failure budget is spent
//! - Idles while a sleep deadline is pending
//! - Skips rows whose key already has a logged outcome
//! - Otherwise fetches the row at the cursor and applies the back-off rules
//!
//! `tick` takes `&mut self`, so a second tick can never start while a fetch is
//! in flight. Time is passed in, which keeps every transition testable without
//! waiting on a wall clock.

use crate::harvest::backoff::{BackoffController, FailureVerdict, SuccessVerdict};
use crate::harvest::coordinator::{RunReport, RunStatus};
use crate::harvest::refiner::Refiner;
use crate::harvest::transport::Transport;
use crate::seed::{DedupIndex, SeedRow};
use crate::state::{RunPhase, RunState};
use crate::storage::{FetchOutcome, ResponseLog};
use crate::HarvestError;
use tokio::time::Instant;

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A sleep deadline is pending; nothing happened
    Sleeping,

    /// The row already had a logged outcome
    Skipped { ordinal: u64 },

    /// The row was fetched and logged
    Fetched { ordinal: u64, paused: bool },

    /// The response triggered a back-off and was dropped
    Discarded { ordinal: u64 },

    /// The fetch failed
    Failed { ordinal: u64, abandoned: bool },

    /// The run is over; further ticks return the same report
    Finished(RunReport),
}

impl TickOutcome {
    /// True when the next tick should run immediately instead of waiting for the timer
    pub fn reenters(&self) -> bool {
        matches!(self, Self::Skipped { .. } | Self::Failed { .. })
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    pub fetched: usize,
    pub skipped: usize,
    pub failed_attempts: usize,
    pub abandoned: usize,
    pub discarded: usize,
    pub back_offs: usize,
}

/// Owns the run state and coordinates seeds, dedup, transport, log and refiner
pub struct Scheduler {
    label: String,
    rows: Vec<SeedRow>,
    state: RunState,
    done: DedupIndex,
    log: Box<dyn ResponseLog>,
    transport: Box<dyn Transport>,
    backoff: BackoffController,
    refiner: Option<Refiner>,
    tally: RunTally,
    report: Option<RunReport>,
}

impl Scheduler {
    /// Creates a scheduler over `rows[start..end]`
    ///
    /// `end` is clamped to the number of rows.
    pub fn new(
        label: impl Into<String>,
        rows: Vec<SeedRow>,
        start: usize,
        end: usize,
        done: DedupIndex,
        log: Box<dyn ResponseLog>,
        transport: Box<dyn Transport>,
        backoff: BackoffController,
    ) -> Self {
        let end = end.min(rows.len());
        Self {
            label: label.into(),
            rows,
            state: RunState::new(start, end),
            done,
            log,
            transport,
            backoff,
            refiner: None,
            tally: RunTally::default(),
            report: None,
        }
    }

    /// Enables reassembly when the run stops
    pub fn with_refiner(mut self, refiner: Refiner) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn tally(&self) -> &RunTally {
        &self.tally
    }

    pub fn done(&self) -> &DedupIndex {
        &self.done
    }

    pub fn refiner(&self) -> Option<&Refiner> {
        self.refiner.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Performs at most one unit of work
    ///
    /// Only a failed append to the response log is an error; the run must not go
    /// on once the log no longer reflects the work that was done.
    pub async fn tick(&mut self, now: Instant) -> Result<TickOutcome, HarvestError> {
        if let Some(report) = &self.report {
            return Ok(TickOutcome::Finished(report.clone()));
        }

        if self.state.is_exhausted() {
            return self.finish(RunPhase::Done).map(TickOutcome::Finished);
        }

        if self.backoff.should_abort(&self.state) {
            return self.finish(RunPhase::Aborted).map(TickOutcome::Finished);
        }

        if self.state.is_sleeping(now) {
            self.state.phase = RunPhase::Sleeping;
            tracing::trace!("[{}] sleeping, tick skipped", self.label);
            return Ok(TickOutcome::Sleeping);
        }
        self.state.phase = RunPhase::Running;

        let row = &self.rows[self.state.cursor];
        let ordinal = row.id;

        if self.done.contains(row) {
            tracing::debug!("[{}] row {} already fetched, skipping", self.label, ordinal);
            self.state.advance();
            self.tally.skipped += 1;
            return Ok(TickOutcome::Skipped { ordinal });
        }

        match self.transport.fetch(row).await {
            Err(e) => {
                self.tally.failed_attempts += 1;
                let attempt = self.state.record_fail_count + 1;
                let cursor = self.state.cursor;
                let verdict = self.backoff.on_failure(&mut self.state, now);
                tracing::warn!(
                    "[{}] fetch failed for row {} (attempt {}, {} consecutive): {}",
                    self.label,
                    ordinal,
                    attempt,
                    self.state.run_fail_count,
                    e
                );

                // an aborting failure may also have used up the record's attempts
                let abandoned = self.state.cursor != cursor;
                if abandoned {
                    self.tally.abandoned += 1;
                    tracing::warn!("[{}] giving up on row {}", self.label, ordinal);
                }
                if verdict == FailureVerdict::Abort {
                    tracing::error!("[{}] failure budget spent", self.label);
                }

                Ok(TickOutcome::Failed { ordinal, abandoned })
            }

            Ok(payload) => {
                let verdict = self
                    .backoff
                    .on_success(&mut self.state, now, &payload, row);

                if verdict != SuccessVerdict::Keep {
                    self.tally.back_offs += 1;
                    tracing::warn!(
                        "[{}] back-off triggered by row {}, pausing for {:?}",
                        self.label,
                        ordinal,
                        self.backoff.settings().back_off
                    );
                }

                if verdict == SuccessVerdict::Discard {
                    self.tally.discarded += 1;
                    return Ok(TickOutcome::Discarded { ordinal });
                }

                let outcome = FetchOutcome::new(row.clone(), payload);
                if let Err(e) = self.log.append(&outcome) {
                    tracing::error!(
                        "[{}] failed to persist row {}, stopping: {}",
                        self.label,
                        ordinal,
                        e
                    );
                    return Err(e.into());
                }

                self.done.insert(&outcome.seed);
                if let Some(refiner) = self.refiner.as_mut() {
                    refiner.buffer(outcome);
                }
                self.state.advance();
                self.tally.fetched += 1;
                tracing::debug!("[{}] fetched row {}", self.label, ordinal);

                Ok(TickOutcome::Fetched {
                    ordinal,
                    paused: verdict == SuccessVerdict::KeepAndPause,
                })
            }
        }
    }

    /// Stops the run without reassembly
    pub fn interrupt(&mut self) -> RunReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        tracing::warn!(
            "[{}] interrupted at row {} of {}",
            self.label,
            self.state.cursor,
            self.state.end
        );
        let report = RunReport::new(RunStatus::Interrupted, &self.tally, &self.state, None);
        self.report = Some(report.clone());
        report
    }

    /// Moves to a terminal phase and runs the completion hook
    fn finish(&mut self, phase: RunPhase) -> Result<RunReport, HarvestError> {
        self.state.phase = phase;
        let status = if phase == RunPhase::Aborted {
            tracing::error!(
                "[{}] aborting after {} consecutive failures",
                self.label,
                self.state.run_fail_count
            );
            RunStatus::Aborted
        } else {
            tracing::info!("[{}] all rows in range handled", self.label);
            RunStatus::Completed
        };

        // Recorded before reassembly so a refine failure cannot restart the run
        let mut report = RunReport::new(status, &self.tally, &self.state, None);
        self.report = Some(report.clone());

        if let Some(refiner) = self.refiner.as_mut() {
            let rows = refiner.run()?;
            report.refined_rows = Some(rows);
            self.report = Some(report.clone());
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscardedRecord;
    use crate::harvest::backoff::{BackoffSettings, NeverBackOff};
    use crate::harvest::refiner::{RefineError, RefineTarget};
    use crate::harvest::transport::FetchError;
    use crate::storage::{MemoryResponseLog, StorageError, StorageResult};
    use indexmap::IndexMap;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_settings() -> BackoffSettings {
        BackoffSettings {
            tick_interval: Duration::from_secs(1),
            back_off: Duration::from_secs(60),
            max_record_fail_count: 3,
            max_fail_count: 5,
            sleep_intervals_after_fail: 0,
            discard_on_back_off: false,
            discarded_record: DiscardedRecord::Retry,
        }
    }

    fn rows(keys: &[&str]) -> Vec<SeedRow> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| SeedRow {
                id: i as u64 + 1,
                fields: IndexMap::from([("id".to_string(), key.to_string())]),
                raw: format!("{key},row{i}"),
                extra: IndexMap::new(),
            })
            .collect()
    }

    fn key_columns() -> Vec<String> {
        vec!["id".to_string()]
    }

    /// Transport that fails a key a scripted number of times, then echoes it
    ///
    /// Clones share their script and call record.
    #[derive(Clone)]
    struct ScriptedTransport {
        failures: Arc<Mutex<HashMap<String, u32>>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        fn new(failures: &[(&str, u32)]) -> Self {
            Self {
                failures: Arc::new(Mutex::new(
                    failures
                        .iter()
                        .map(|(k, n)| (k.to_string(), *n))
                        .collect(),
                )),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch(&self, seed: &SeedRow) -> Result<Value, FetchError> {
            let key = seed.field("id").unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(key.clone());
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&key) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(FetchError::Network("scripted".to_string()))
                }
                _ => Ok(json!({ "status": 200, "body": { "key": key } })),
            }
        }
    }

    /// Log whose appends always fail
    struct BrokenLog;

    impl ResponseLog for BrokenLog {
        fn append(&mut self, _outcome: &FetchOutcome) -> StorageResult<()> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn load_all(&self) -> StorageResult<Vec<FetchOutcome>> {
            Ok(Vec::new())
        }
    }

    fn scheduler(
        rows: Vec<SeedRow>,
        done: DedupIndex,
        log: Box<dyn ResponseLog>,
        transport: Box<dyn Transport>,
        settings: BackoffSettings,
    ) -> Scheduler {
        let end = rows.len();
        Scheduler::new(
            "test",
            rows,
            0,
            end,
            done,
            log,
            transport,
            BackoffController::new(settings, Box::new(NeverBackOff)),
        )
    }

    async fn run_to_end(scheduler: &mut Scheduler, now: &mut Instant) -> RunReport {
        for _ in 0..1000 {
            if let TickOutcome::Finished(report) = scheduler.tick(*now).await.unwrap() {
                return report;
            }
            *now += Duration::from_secs(1);
        }
        panic!("scheduler did not finish");
    }

    #[tokio::test]
    async fn test_skips_rows_already_logged() {
        let prior_row = rows(&["A", "B", "C"]).remove(1);
        let log = MemoryResponseLog::with_records(vec![FetchOutcome::new(prior_row, json!({}))]);
        let done = DedupIndex::build(&log.records(), &key_columns());
        let transport = ScriptedTransport::new(&[]);

        let mut scheduler = scheduler(
            rows(&["A", "B", "C"]),
            done,
            Box::new(log.clone()),
            Box::new(transport.clone()),
            create_test_settings(),
        );

        let now = Instant::now();
        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Fetched { ordinal: 1, paused: false }
        );
        let skipped = scheduler.tick(now).await.unwrap();
        assert_eq!(skipped, TickOutcome::Skipped { ordinal: 2 });
        assert!(skipped.reenters());
        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Fetched { ordinal: 3, paused: false }
        );
        assert!(matches!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Finished(RunReport { status: RunStatus::Completed, .. })
        ));

        let records = log.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].seed.field("id"), Some("A"));
        assert_eq!(records[2].seed.field("id"), Some("C"));
        assert_eq!(*transport.calls.lock().unwrap(), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_retry_then_success_resets_failures() {
        let transport = ScriptedTransport::new(&[("A", 2)]);
        let log = MemoryResponseLog::new();
        let mut scheduler = scheduler(
            rows(&["A"]),
            DedupIndex::new(key_columns()),
            Box::new(log.clone()),
            Box::new(transport.clone()),
            create_test_settings(),
        );
        let now = Instant::now();

        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Failed { ordinal: 1, abandoned: false }
        );
        assert_eq!(scheduler.state().run_fail_count, 1);
        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Failed { ordinal: 1, abandoned: false }
        );
        assert_eq!(scheduler.state().record_fail_count, 2);
        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Fetched { ordinal: 1, paused: false }
        );

        assert_eq!(scheduler.state().record_fail_count, 0);
        assert_eq!(scheduler.state().run_fail_count, 0);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_record_abandoned_after_max_failures() {
        let transport = ScriptedTransport::new(&[("A", 3)]);
        let log = MemoryResponseLog::new();
        let mut scheduler = scheduler(
            rows(&["A", "B"]),
            DedupIndex::new(key_columns()),
            Box::new(log.clone()),
            Box::new(transport.clone()),
            create_test_settings(),
        );
        let now = Instant::now();

        scheduler.tick(now).await.unwrap();
        scheduler.tick(now).await.unwrap();
        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Failed { ordinal: 1, abandoned: true }
        );
        assert_eq!(scheduler.state().cursor, 1);
        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Fetched { ordinal: 2, paused: false }
        );

        let mut now = now;
        let report = run_to_end(&mut scheduler, &mut now).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.fetched, 1);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_run_aborts_and_stops_fetching() {
        let transport = ScriptedTransport::new(&[("A", 10), ("B", 10), ("C", 10)]);
        let mut settings = create_test_settings();
        settings.max_record_fail_count = 2;
        settings.max_fail_count = 3;
        let mut scheduler = scheduler(
            rows(&["A", "B", "C"]),
            DedupIndex::new(key_columns()),
            Box::new(MemoryResponseLog::new()),
            Box::new(transport.clone()),
            settings,
        );

        let mut now = Instant::now();
        let report = run_to_end(&mut scheduler, &mut now).await;

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(scheduler.state().phase, RunPhase::Aborted);
        assert_eq!(transport.calls.lock().unwrap().len(), 3);

        // further ticks neither fetch nor change the outcome
        assert!(matches!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Finished(RunReport { status: RunStatus::Aborted, .. })
        ));
        assert_eq!(transport.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sleeping_ticks_do_not_touch_counters() {
        let transport = ScriptedTransport::new(&[("A", 1)]);
        let mut settings = create_test_settings();
        settings.sleep_intervals_after_fail = 3;
        let mut scheduler = scheduler(
            rows(&["A"]),
            DedupIndex::new(key_columns()),
            Box::new(MemoryResponseLog::new()),
            Box::new(transport.clone()),
            settings,
        );
        let now = Instant::now();

        scheduler.tick(now).await.unwrap();
        let before = scheduler.state().clone();

        for secs in [0, 1, 2] {
            assert_eq!(
                scheduler.tick(now + Duration::from_secs(secs)).await.unwrap(),
                TickOutcome::Sleeping
            );
        }
        assert_eq!(scheduler.state().phase, RunPhase::Sleeping);
        assert_eq!(scheduler.state().cursor, before.cursor);
        assert_eq!(scheduler.state().run_fail_count, before.run_fail_count);
        assert_eq!(transport.calls.lock().unwrap().len(), 1);

        assert_eq!(
            scheduler.tick(now + Duration::from_secs(3)).await.unwrap(),
            TickOutcome::Fetched { ordinal: 1, paused: false }
        );
    }

    #[tokio::test]
    async fn test_back_off_discard_retries_same_row() {
        let mut settings = create_test_settings();
        settings.discard_on_back_off = true;
        let first = std::sync::atomic::AtomicBool::new(true);
        let policy = move |_: &Value, _: &SeedRow, _: u32| {
            first.swap(false, std::sync::atomic::Ordering::SeqCst)
        };
        let log = MemoryResponseLog::new();
        let transport = ScriptedTransport::new(&[]);
        let mut scheduler = Scheduler::new(
            "test",
            rows(&["A"]),
            0,
            1,
            DedupIndex::new(key_columns()),
            Box::new(log.clone()),
            Box::new(transport.clone()),
            BackoffController::new(settings, Box::new(policy)),
        );
        let now = Instant::now();

        assert_eq!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Discarded { ordinal: 1 }
        );
        assert!(log.is_empty());
        assert_eq!(
            scheduler.tick(now + Duration::from_secs(30)).await.unwrap(),
            TickOutcome::Sleeping
        );
        assert_eq!(
            scheduler.tick(now + Duration::from_secs(60)).await.unwrap(),
            TickOutcome::Fetched { ordinal: 1, paused: false }
        );
        assert_eq!(log.len(), 1);
        assert_eq!(scheduler.tally().back_offs, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let transport = ScriptedTransport::new(&[]);
        let mut scheduler = scheduler(
            rows(&["A", "B"]),
            DedupIndex::new(key_columns()),
            Box::new(BrokenLog),
            Box::new(transport),
            create_test_settings(),
        );

        let result = scheduler.tick(Instant::now()).await;
        assert!(matches!(result, Err(HarvestError::Persistence(_))));
        assert_eq!(scheduler.state().cursor, 0);
        assert!(scheduler.done().is_empty());
    }

    #[tokio::test]
    async fn test_completion_runs_refiner() {
        let dir = TempDir::new().unwrap();
        let target = RefineTarget {
            header: "id,label".to_string(),
            separator: ",".to_string(),
            line_terminator: "\n".to_string(),
            path: dir.path().join("refined.csv"),
            restore_order: false,
        };
        let refine = |o: &FetchOutcome| -> IndexMap<String, String> {
            IndexMap::from([(
                "key".to_string(),
                o.payload["body"]["key"].as_str().unwrap_or_default().to_string(),
            )])
        };
        let transport = ScriptedTransport::new(&[]);
        let mut scheduler = scheduler(
            rows(&["A", "B"]),
            DedupIndex::new(key_columns()),
            Box::new(MemoryResponseLog::new()),
            Box::new(transport),
            create_test_settings(),
        )
        .with_refiner(Refiner::new(Box::new(refine), target.clone()));

        let mut now = Instant::now();
        let report = run_to_end(&mut scheduler, &mut now).await;

        assert_eq!(report.refined_rows, Some(2));
        assert_eq!(
            std::fs::read_to_string(&target.path).unwrap(),
            "id,label,key\nA,row0,A\nB,row1,B\n"
        );
    }

    #[tokio::test]
    async fn test_refine_failure_leaves_log_intact() {
        let dir = TempDir::new().unwrap();
        let target = RefineTarget {
            header: "id,label".to_string(),
            separator: ",".to_string(),
            line_terminator: "\n".to_string(),
            path: dir.path().join("refined.csv"),
            restore_order: false,
        };
        let refine = |o: &FetchOutcome| -> IndexMap<String, String> {
            IndexMap::from([(format!("col{}", o.ordinal()), String::new())])
        };
        let log = MemoryResponseLog::new();
        let transport = ScriptedTransport::new(&[]);
        let mut scheduler = scheduler(
            rows(&["A", "B"]),
            DedupIndex::new(key_columns()),
            Box::new(log.clone()),
            Box::new(transport),
            create_test_settings(),
        )
        .with_refiner(Refiner::new(Box::new(refine), target.clone()));

        let now = Instant::now();
        scheduler.tick(now).await.unwrap();
        scheduler.tick(now).await.unwrap();
        let result = scheduler.tick(now).await;

        assert!(matches!(
            result,
            Err(HarvestError::Refine(RefineError::Consistency { ordinal: 2, .. }))
        ));
        assert_eq!(log.len(), 2);
        assert!(!target.path.exists());
        assert!(matches!(
            scheduler.tick(now).await.unwrap(),
            TickOutcome::Finished(RunReport { status: RunStatus::Completed, refined_rows: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_interrupt_skips_refine() {
        let transport = ScriptedTransport::new(&[]);
        let mut scheduler = scheduler(
            rows(&["A", "B"]),
            DedupIndex::new(key_columns()),
            Box::new(MemoryResponseLog::new()),
            Box::new(transport),
            create_test_settings(),
        );
        scheduler.tick(Instant::now()).await.unwrap();

        let report = scheduler.interrupt();
        assert_eq!(report.status, RunStatus::Interrupted);
        assert_eq!(report.fetched, 1);
        assert_eq!(report.remaining, 1);
    }
}
