//! Sumi-Harvest main entry point
//!
//! This is the command-line interface for the Sumi-Harvest record fetcher.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use sumi_harvest::config::{load_config_with_hash, Config};
use sumi_harvest::harvest::{refine_from_log, run_harvest, RunStatus};
use sumi_harvest::HarvestError;
use tracing_subscriber::EnvFilter;

/// Sumi-Harvest: a resumable, rate-respecting record fetcher
///
/// Sumi-Harvest walks the rows of a seed file, fetches remote data for each
/// one, logs every response so an interrupted run picks up where it stopped,
/// and finally writes the seed rows back out with the fetched fields appended.
#[derive(Parser, Debug)]
#[command(name = "sumi-harvest")]
#[command(version)]
#[command(about = "A resumable, rate-respecting record fetcher", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be fetched without fetching
    #[arg(long, conflicts_with_all = ["stats", "refine_only"])]
    dry_run: bool,

    /// Show progress statistics from the response log and exit
    #[arg(long, conflicts_with_all = ["dry_run", "refine_only"])]
    stats: bool,

    /// Rebuild the refined output from the existing response log and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats"])]
    refine_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            exit_code_for(&e)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    if cli.dry_run {
        handle_dry_run(&config)?;
        Ok(ExitCode::SUCCESS)
    } else if cli.stats {
        handle_stats(&config)?;
        Ok(ExitCode::SUCCESS)
    } else if cli.refine_only {
        handle_refine_only(&config)?;
        Ok(ExitCode::SUCCESS)
    } else {
        handle_harvest(config).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_harvest=info,warn"),
            1 => EnvFilter::new("sumi_harvest=debug,info"),
            2 => EnvFilter::new("sumi_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Maps a failure to the process exit code
fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<HarvestError>() {
        Some(HarvestError::RunAborted { .. }) => ExitCode::from(2),
        Some(HarvestError::Persistence(_)) => ExitCode::from(3),
        Some(HarvestError::Refine(_)) => ExitCode::from(4),
        _ => ExitCode::FAILURE,
    }
}

/// Handles the --dry-run mode: validates config and shows what would be fetched
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    use sumi_harvest::output::load_statistics;

    println!("=== Sumi-Harvest Dry Run ===\n");

    println!("Run Configuration:");
    println!("  Label: {}", config.run.label);
    println!("  Tick interval: {}ms", config.run.tick_interval_ms);
    println!("  Back-off: {} minutes", config.run.back_off_minutes);
    println!("  Shuffle: {}", config.run.shuffle);
    println!(
        "  Failure limits: {} per record, {} per run",
        config.run.max_record_fail_count, config.run.max_fail_count
    );
    println!("  Refine: {}", config.run.refine);

    println!("\nSeed:");
    println!("  File: {} ({})", config.seed.path, config.seed.format);
    println!("  Key columns: {}", config.seed.key_columns.join(", "));

    println!("\nTransport:");
    println!("  {} {}", config.transport.method, config.transport.url_template);

    println!("\nOutput:");
    println!("  Response log: {}", config.output.response_log_path);
    println!("  Refined: {}", config.output.refined_path);

    let stats = load_statistics(config)?;

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would fetch {} of {} rows in range ({} already logged)",
        stats.remaining_in_range,
        stats.range_len,
        stats.range_len - stats.remaining_in_range
    );
    if stats.range_is_estimate {
        println!("  (estimate: shuffle-seed is unset, so each run draws a different range)");
    }

    Ok(())
}

/// Handles the --stats mode: shows progress from the response log
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    use sumi_harvest::output::{load_statistics, print_statistics};

    println!("Seed file: {}", config.seed.path);
    println!("Response log: {}\n", config.output.response_log_path);

    let stats = load_statistics(config)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --refine-only mode
fn handle_refine_only(config: &Config) -> anyhow::Result<()> {
    let rows = refine_from_log(config)?;
    println!("✓ Refined {} rows into {}", rows, config.output.refined_path);
    Ok(())
}

/// Handles the main harvest operation
async fn handle_harvest(config: Config) -> anyhow::Result<ExitCode> {
    tracing::info!(
        "Starting harvest '{}' (seed: {}, log: {})",
        config.run.label,
        config.seed.path,
        config.output.response_log_path
    );

    let report = run_harvest(config).await?;
    println!(
        "Harvest {}: {} fetched, {} skipped, {} abandoned, {} remaining",
        report.status, report.fetched, report.skipped, report.abandoned, report.remaining
    );

    if report.status == RunStatus::Interrupted {
        println!("Interrupted; run again to resume");
    }

    report.into_result()?;
    Ok(ExitCode::SUCCESS)
}
