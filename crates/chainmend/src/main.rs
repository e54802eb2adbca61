//! chainmend CLI
//!
//! Thin wrapper over `chainmend-core`: resolves configuration, sets up
//! logging and dispatches to one of the subcommands.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use chainmend_core::binlog::BinaryLogReader;
use chainmend_core::config::{Config, LogFormat};
use chainmend_core::error::format_error_with_remediation;
use chainmend_core::gap::{self, HeightRange, ReplicaIndex};
use chainmend_core::logging::init_logging;
use chainmend_core::remote::RemoteFetcher;
use chainmend_core::repair::{RangeOutcome, RepairMode, RepairReport, RepairRunner};
use chainmend_core::replica::SqliteReplica;
use chainmend_core::strategy::RepairRange;

/// Configuration, replica and commit errors.
const EXIT_FATAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "chainmend",
    author,
    version,
    about = "Detect and backfill missing block heights in a relational replica"
)]
struct Cli {
    /// Config file (default: $CHAINMEND_CONFIG, then the user config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `info` or `chainmend_core=debug`
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect gaps and backfill them
    Repair(RepairArgs),

    /// List detected gaps without repairing
    Gaps {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Summarize the binary state-change log
    ScanLog {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct RepairArgs {
    /// First height of a manual range (bypasses gap detection)
    #[arg(long, requires = "end", conflicts_with = "heights_file")]
    start: Option<u64>,

    /// Last height of a manual range, inclusive
    #[arg(long, requires = "start")]
    end: Option<u64>,

    /// File with one height per line to reprocess
    #[arg(long, value_name = "PATH")]
    heights_file: Option<PathBuf>,

    /// Concurrent fetch workers for parallel ranges
    #[arg(long)]
    workers: Option<usize>,

    /// Node serving the block API
    #[arg(long, value_name = "URL")]
    node_url: Option<String>,

    /// Directory holding the binary state-change log
    #[arg(long, value_name = "DIR")]
    state_change_dir: Option<PathBuf>,

    /// Print the planned ranges and strategies without fetching
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            if let Some(core_err) = err.downcast_ref::<chainmend_core::Error>() {
                eprintln!("{}", format_error_with_remediation(core_err));
            } else {
                eprintln!("Error: {err:#}");
            }
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let (mut config, config_path) = load_config(cli.config.as_deref())?;
    if let Command::Repair(args) = &cli.command {
        apply_repair_flags(&mut config, args);
    }
    config.validate().map_err(chainmend_core::Error::from)?;

    let mut log_config = config.logging.clone();
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    init_logging(&log_config).context("failed to initialize logging")?;
    match &config_path {
        Some(path) => info!(path = %path.display(), "loaded config"),
        None => info!("no config file found; using defaults"),
    }

    match cli.command {
        Command::Repair(args) => repair(&config, &args).await,
        Command::Gaps { json } => gaps(&config, json),
        Command::ScanLog { json } => scan_log(&config, json),
        Command::Config => {
            print!(
                "{}",
                config.to_toml_string().map_err(chainmend_core::Error::from)?
            );
            Ok(0)
        }
    }
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let lookup = |key: &str| std::env::var(key).ok();
    let (mut config, path) =
        Config::load_resolved(explicit, lookup).map_err(chainmend_core::Error::from)?;
    config
        .apply_env_overrides(lookup)
        .map_err(chainmend_core::Error::from)?;
    Ok((config, path))
}

fn apply_repair_flags(config: &mut Config, args: &RepairArgs) {
    if let Some(workers) = args.workers {
        config.repair.workers = workers;
    }
    if let Some(url) = &args.node_url {
        config.remote.node_url.clone_from(url);
    }
    if let Some(dir) = &args.state_change_dir {
        config.binlog.dir = Some(dir.clone());
    }
}

fn repair_mode(args: &RepairArgs) -> anyhow::Result<RepairMode> {
    if let Some(path) = &args.heights_file {
        let ranges = gap::load_heights_file(path).map_err(chainmend_core::Error::from)?;
        return Ok(RepairMode::Manual(ranges));
    }
    match (args.start, args.end) {
        (Some(start), Some(end)) => {
            let range = HeightRange::new(start, end)
                .with_context(|| format!("invalid manual range --start {start} --end {end}"))?;
            Ok(RepairMode::Manual(vec![range]))
        }
        _ => Ok(RepairMode::DetectGaps),
    }
}

fn open_log(config: &Config) -> anyhow::Result<Option<BinaryLogReader>> {
    if config.binlog.dir.is_none() {
        info!("no state-change directory configured; large ranges use the remote API");
        return Ok(None);
    }
    if !config.binlog.is_available() {
        warn!(
            dir = ?config.binlog.dir,
            "binary log files not found; large ranges use the remote API"
        );
        return Ok(None);
    }
    let reader = BinaryLogReader::open_json(&config.binlog).map_err(chainmend_core::Error::from)?;
    info!(entries = reader.len(), "opened binary log");
    Ok(Some(reader))
}

async fn repair(config: &Config, args: &RepairArgs) -> anyhow::Result<u8> {
    let mode = repair_mode(args)?;
    let replica = SqliteReplica::open(&config.replica).map_err(chainmend_core::Error::from)?;
    let fetcher = Arc::new(RemoteFetcher::new(&config.remote)?);
    let log = open_log(config)?;
    info!(
        replica = %config.replica.path.display(),
        node = %fetcher.endpoint(),
        workers = config.repair.workers,
        "starting repair"
    );

    let mut runner = RepairRunner::new(config.repair.clone(), fetcher, log, replica);
    if args.dry_run {
        let plan = runner.plan(&mode)?;
        print_plan(&plan);
        return Ok(0);
    }

    let report = runner.run(&mode).await?;
    print_report(&report);
    Ok(report.exit_code())
}

fn print_plan(plan: &[RepairRange]) {
    if plan.is_empty() {
        println!("No missing heights.");
        return;
    }
    for item in plan {
        println!(
            "{:<24} {:>10} heights  {}",
            item.range.to_string(),
            item.range.size(),
            item.strategy
        );
    }
}

fn print_report(report: &RepairReport) {
    for entry in &report.ranges {
        let range = entry.planned.range.to_string();
        match &entry.outcome {
            RangeOutcome::Repaired { applied, .. } => {
                println!("{range:<24} repaired ({applied} records)");
            }
            RangeOutcome::Skipped { reason } => println!("{range:<24} skipped: {reason}"),
            RangeOutcome::Failed(err) => println!("{range:<24} FAILED: {err}"),
        }
    }
    println!(
        "{} repaired, {} skipped, {} failed",
        report.repaired(),
        report.skipped(),
        report.failed()
    );
}

#[derive(Serialize)]
struct GapListing {
    start: u64,
    end: u64,
    size: u64,
}

#[derive(Serialize)]
struct GapsOutput {
    gaps: Vec<GapListing>,
    total_missing: u64,
    lowest_height: Option<u64>,
    highest_height: Option<u64>,
}

fn gaps(config: &Config, json: bool) -> anyhow::Result<u8> {
    let replica =
        SqliteReplica::open_existing(&config.replica.path).map_err(chainmend_core::Error::from)?;
    let gaps = gap::detect_gaps(&replica, config.repair.detect_from_genesis)
        .map_err(chainmend_core::Error::from)?;
    let output = GapsOutput {
        total_missing: gap::total_missing(&gaps),
        lowest_height: replica.min_height().map_err(chainmend_core::Error::from)?,
        highest_height: replica.max_height().map_err(chainmend_core::Error::from)?,
        gaps: gaps
            .iter()
            .map(|g| GapListing {
                start: g.start(),
                end: g.end(),
                size: g.size(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if output.gaps.is_empty() {
        println!("No missing heights.");
    } else {
        for g in &gaps {
            println!("{:<24} {:>10} heights", g.to_string(), g.size());
        }
        println!(
            "{} missing heights in {} gaps",
            output.total_missing,
            output.gaps.len()
        );
    }
    Ok(0)
}

fn scan_log(config: &Config, json: bool) -> anyhow::Result<u8> {
    let mut reader =
        BinaryLogReader::open_json(&config.binlog).map_err(chainmend_core::Error::from)?;
    let report = reader
        .coverage_report()
        .map_err(chainmend_core::Error::from)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(0);
    }
    println!("entries:           {}", report.entries);
    println!("block records:     {}", report.block_records);
    println!("other records:     {}", report.other_records);
    println!("decode errors:     {}", report.decode_errors);
    println!("distinct heights:  {}", report.distinct_heights);
    println!("duplicate heights: {}", report.duplicate_heights);
    match (report.min_height, report.max_height) {
        (Some(min), Some(max)) => println!("height span:       [{min}, {max}]"),
        _ => println!("height span:       none"),
    }
    println!("missing heights:   {}", report.missing_heights);
    for g in report.gaps.iter().take(20) {
        println!("  {g}");
    }
    if report.gaps.len() > 20 {
        println!("  ... {} more gaps", report.gaps.len() - 20);
    }
    Ok(0)
}
