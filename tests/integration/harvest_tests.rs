//! Integration tests for the harvester
//!
//! These tests drive complete runs against a real file-backed response log,
//! with scripted transports or a wiremock server standing in for the remote side.

use indexmap::IndexMap;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use sumi_harvest::config::{load_config, Config};
use sumi_harvest::harvest::{FetchError, Harvester, RunReport, RunStatus, Transport};
use sumi_harvest::output::load_statistics;
use sumi_harvest::storage::{FetchOutcome, FileResponseLog, ResponseLog, StorageError, StorageResult};
use sumi_harvest::{HarvestError, SeedRow};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEEDS: &str = "id,name,colour\nA,apple,red\nB,banana,yellow\nC,cherry,red\n";

/// Writes the seed file and a config into `dir` and loads it
///
/// `run_extra` is appended to the `[run]` table.
fn create_test_config(dir: &TempDir, seeds: &str, url_template: &str, run_extra: &str) -> Config {
    let seed_path = dir.path().join("seeds.csv");
    fs::write(&seed_path, seeds).unwrap();

    let toml = format!(
        r#"
[run]
label = "integration"
tick-interval-ms = 1
back-off-minutes = 0.0
max-record-fail-count = 3
max-fail-count = 5
sleep-intervals-after-fail = 0
discard-on-back-off = false
shuffle = false
refine = false
{run_extra}

[seed]
path = '{seed}'
format = "csv"
line-terminator = "\n"
key-columns = ["id"]
[seed.columns]
id = 0
name = 1

[output]
response-log-path = '{log}'
refined-path = '{refined}'

[transport]
url-template = '{url_template}'
timeout-secs = 5

[[refine.fields]]
name = "title"
pointer = "/body/title"
"#,
        seed = seed_path.display(),
        log = dir.path().join("responses.jsonl").display(),
        refined = dir.path().join("refined.csv").display(),
    );

    let config_path = dir.path().join("harvest.toml");
    fs::write(&config_path, toml).unwrap();
    load_config(&config_path).unwrap()
}

fn echo(row: &SeedRow) -> Result<Value, FetchError> {
    let name = row.field("name").unwrap_or_default();
    Ok(json!({ "status": 200, "body": { "title": name.to_uppercase() } }))
}

fn logged_keys(config: &Config) -> Vec<String> {
    FileResponseLog::open(Path::new(&config.output.response_log_path))
        .unwrap()
        .load_all()
        .unwrap()
        .iter()
        .map(|o| o.seed.field("id").unwrap_or_default().to_string())
        .collect()
}

fn seed_row(id: u64, key: &str, name: &str) -> SeedRow {
    SeedRow {
        id,
        fields: IndexMap::from([
            ("id".to_string(), key.to_string()),
            ("name".to_string(), name.to_string()),
        ]),
        raw: format!("{key},{name}"),
        extra: IndexMap::new(),
    }
}

fn prelog(config: &Config, rows: &[SeedRow]) {
    let mut log = FileResponseLog::open(Path::new(&config.output.response_log_path)).unwrap();
    for row in rows {
        log.append(&FetchOutcome::new(row.clone(), echo(row).unwrap()))
            .unwrap();
    }
}

async fn run(config: Config, transport: impl Transport + 'static) -> RunReport {
    let mut harvester = Harvester::builder(config)
        .transport(transport)
        .build()
        .unwrap();
    harvester.run_until(std::future::pending()).await.unwrap()
}

#[tokio::test]
async fn test_prior_outcome_is_skipped_in_order() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, SEEDS, "http://127.0.0.1:9/{id}", "");
    prelog(&config, &[seed_row(2, "B", "banana")]);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let transport = move |row: &SeedRow| -> Result<Value, FetchError> {
        seen.lock().unwrap().push(row.field("id").unwrap_or_default().to_string());
        echo(row)
    };

    let report = run(config.clone(), transport).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(*calls.lock().unwrap(), vec!["A", "C"]);
    assert_eq!(logged_keys(&config), vec!["B", "A", "C"]);
}

#[tokio::test]
async fn test_dedup_ignores_non_key_columns() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, SEEDS, "http://127.0.0.1:9/{id}", "");
    // same key, different name than the seed file holds
    prelog(&config, &[seed_row(2, "B", "plantain")]);

    let report = run(config.clone(), echo).await;

    assert_eq!(report.skipped, 1);
    assert_eq!(logged_keys(&config), vec!["B", "A", "C"]);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, SEEDS, "http://127.0.0.1:9/{id}", "end = 2");

    let first = run(config.clone(), echo).await;
    assert_eq!(first.fetched, 2);

    let mut full = config.clone();
    full.run.end = None;
    let second = run(full.clone(), echo).await;
    assert_eq!(second.fetched, 1);
    assert_eq!(second.skipped, 2);

    let third = run(full.clone(), echo).await;
    assert_eq!(third.fetched, 0);
    assert_eq!(third.skipped, 3);

    assert_eq!(logged_keys(&full), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_retry_until_success_logs_once() {
    let dir = TempDir::new().unwrap();
    let seeds = "id,name\nA,apple\n";
    let config = create_test_config(&dir, seeds, "http://127.0.0.1:9/{id}", "");

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let transport = move |row: &SeedRow| -> Result<Value, FetchError> {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(FetchError::Network("connection reset".to_string()))
        } else {
            echo(row)
        }
    };

    let mut harvester = Harvester::builder(config.clone())
        .transport(transport)
        .build()
        .unwrap();
    let report = harvester.run_until(std::future::pending()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.consecutive_failures, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(harvester.scheduler().state().run_fail_count, 0);
    assert_eq!(logged_keys(&config), vec!["A"]);
}

#[tokio::test]
async fn test_abort_reports_error_and_refines_collected() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, SEEDS, "http://127.0.0.1:9/{id}", "");
    config.run.refine = true;
    config.run.max_fail_count = 2;
    let refined_path = config.output.refined_path.clone();

    let transport = |row: &SeedRow| -> Result<Value, FetchError> {
        match row.field("id") {
            Some("A") => echo(row),
            _ => Err(FetchError::Status { status: 503 }),
        }
    };

    let report = run(config.clone(), transport).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.refined_rows, Some(1));
    assert_eq!(logged_keys(&config), vec!["A"]);
    assert_eq!(
        fs::read_to_string(refined_path).unwrap(),
        "id,name,colour,title\nA,apple,red,APPLE\n"
    );
    assert!(matches!(
        report.into_result(),
        Err(HarvestError::RunAborted { failures: 2 })
    ));
}

#[tokio::test]
async fn test_shuffled_run_refines_in_seed_order() {
    let dir = TempDir::new().unwrap();
    let seeds: String = std::iter::once("id,name,colour\n".to_string())
        .chain((1..=12).map(|i| format!("k{i},name{i},c{i}\n")))
        .collect();
    let mut config =
        create_test_config(&dir, &seeds, "http://127.0.0.1:9/{id}", "shuffle-seed = 42");
    config.run.refine = true;
    config.run.shuffle = true;
    let refined_path = config.output.refined_path.clone();

    let report = run(config.clone(), echo).await;
    assert_eq!(report.refined_rows, Some(12));

    let refined = fs::read_to_string(refined_path).unwrap();
    let mut lines = refined.lines();
    assert_eq!(lines.next(), Some("id,name,colour,title"));

    // dropping the new column gives back the seed file byte for byte
    let original: String = std::iter::once("id,name,colour\n".to_string())
        .chain(lines.clone().map(|line| {
            let (base, _) = line.rsplit_once(',').unwrap();
            format!("{base}\n")
        }))
        .collect();
    assert_eq!(original, seeds);

    for (i, line) in lines.enumerate() {
        assert!(line.ends_with(&format!(",NAME{}", i + 1)));
    }
}

#[tokio::test]
async fn test_inconsistent_refine_leaves_log_intact() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, SEEDS, "http://127.0.0.1:9/{id}", "");
    config.run.refine = true;
    let refined_path = config.output.refined_path.clone();

    let refine = |o: &FetchOutcome| -> IndexMap<String, String> {
        let mut fields = IndexMap::new();
        if o.ordinal() == 3 {
            fields.insert("extra".to_string(), String::new());
        }
        fields.insert("title".to_string(), String::new());
        fields
    };

    let mut harvester = Harvester::builder(config.clone())
        .transport(echo)
        .refine_fn(refine)
        .build()
        .unwrap();
    let result = harvester.run_until(std::future::pending()).await;

    assert!(matches!(result, Err(HarvestError::Refine(_))));
    assert_eq!(logged_keys(&config), vec!["A", "B", "C"]);
    assert!(!Path::new(&refined_path).exists());
}

/// Log that accepts a fixed number of appends, then fails
struct FailingLog {
    remaining: usize,
}

impl ResponseLog for FailingLog {
    fn append(&mut self, _outcome: &FetchOutcome) -> StorageResult<()> {
        if self.remaining == 0 {
            return Err(StorageError::Encode("disk full".to_string()));
        }
        self.remaining -= 1;
        Ok(())
    }

    fn load_all(&self) -> StorageResult<Vec<FetchOutcome>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_persistence_failure_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, SEEDS, "http://127.0.0.1:9/{id}", "");

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let transport = move |row: &SeedRow| -> Result<Value, FetchError> {
        counter.fetch_add(1, Ordering::SeqCst);
        echo(row)
    };

    let mut harvester = Harvester::builder(config)
        .transport(transport)
        .response_log(FailingLog { remaining: 1 })
        .build()
        .unwrap();
    let result = harvester.run_until(std::future::pending()).await;

    assert!(matches!(result, Err(HarvestError::Persistence(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_http_harvest_end_to_end() {
    let server = MockServer::start().await;
    for (id, title) in [("A", "Apple"), ("C", "Cherry")] {
        Mock::given(method("GET"))
            .and(path(format!("/items/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "title": title })))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/items/B"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(
        &dir,
        SEEDS,
        &format!("{}/items/{{id}}", server.uri()),
        "",
    );
    config.run.refine = true;
    config.run.max_record_fail_count = 2;
    let refined_path = config.output.refined_path.clone();

    let report = Harvester::from_config(config.clone())
        .unwrap()
        .run_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.abandoned, 1);
    assert_eq!(logged_keys(&config), vec!["A", "C"]);
    assert_eq!(
        fs::read_to_string(refined_path).unwrap(),
        "id,name,colour,title\nA,apple,red,Apple\nC,cherry,red,Cherry\n"
    );
}

#[tokio::test]
async fn test_statistics_match_a_seeded_shuffled_range() {
    let dir = TempDir::new().unwrap();
    let seeds: String = std::iter::once("id,name,colour\n".to_string())
        .chain((1..=12).map(|i| format!("k{i},name{i},c{i}\n")))
        .collect();
    let mut config = create_test_config(&dir, &seeds, "http://127.0.0.1:9/{id}", "end = 5");
    config.run.shuffle = true;
    config.run.shuffle_seed = Some(7);
    let logged: Vec<SeedRow> = (1..=6)
        .map(|i| seed_row(i, &format!("k{i}"), &format!("name{i}")))
        .collect();
    prelog(&config, &logged);

    let stats = load_statistics(&config).unwrap();
    assert_eq!(stats.range_len, 5);
    assert!(!stats.range_is_estimate);

    let report = run(config.clone(), echo).await;
    assert_eq!(report.fetched, stats.remaining_in_range);
    assert_eq!(report.skipped, stats.range_len - stats.remaining_in_range);

    let mut unseeded = config.clone();
    unseeded.run.shuffle_seed = None;
    assert!(load_statistics(&unseeded).unwrap().range_is_estimate);
}
