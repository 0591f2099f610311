//! chatpulse-ingest - apply conversation events to the metrics database
//!
//! Reads newline-delimited JSON records (turn events and feedback
//! submissions) from a file or stdin and folds each one into its daily
//! metric bucket.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/chatpulse/metrics.db (~/.local/share/chatpulse/metrics.db)
//! - Logs: $XDG_STATE_HOME/chatpulse/chatpulse.log (~/.local/state/chatpulse/chatpulse.log)
//! - Config: $XDG_CONFIG_HOME/chatpulse/config.toml (~/.config/chatpulse/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use chatpulse_core::{Config, Database, InboundRecord, IngestCoordinator, IngestResult};
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use process_lock::acquire_ingest_guard;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chatpulse-ingest")]
#[command(about = "Apply conversation events to the daily metrics")]
#[command(version)]
struct Args {
    /// JSONL file with one event per line; reads stdin when omitted or "-"
    input: Option<PathBuf>,

    /// Database path (defaults to the XDG data directory)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file (defaults to the XDG config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output (-v lists dropped records)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let _log_guard =
        chatpulse_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("chatpulse-ingest starting");

    let db_path = args.db.clone().unwrap_or_else(Config::database_path);
    let _ingest_guard = acquire_ingest_guard(&db_path).context("failed to acquire ingest lock")?;

    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    println!("Database: {}", db_path.display());

    let lines = read_input(args.input.as_ref()).context("failed to read input")?;
    // Record index -> 1-based input line, for error reporting
    let line_numbers: Vec<usize> = lines.iter().map(|(n, _)| *n).collect();

    let coordinator = IngestCoordinator::new(db, &config);

    let pb = ProgressBar::new(lines.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let records = lines
        .iter()
        .map(|(_, line)| InboundRecord::from_json(line));
    let result = coordinator.ingest_all_with_progress(records, |i| {
        pb.set_position(i as u64 + 1);
    });

    pb.finish_and_clear();

    print_ingest_result(&result, &line_numbers, args.verbose);

    tracing::info!(
        turns_ingested = result.turns_ingested,
        feedback_ingested = result.feedback_ingested,
        duplicates = result.duplicates,
        malformed = result.malformed,
        failed = result.failed,
        "chatpulse-ingest complete"
    );

    if result.failed > 0 {
        anyhow::bail!(
            "{} record(s) could not be stored; see {}",
            result.failed,
            chatpulse_core::logging::log_file_path().display()
        );
    }

    Ok(())
}

/// Non-blank input lines with their 1-based line numbers
fn read_input(input: Option<&PathBuf>) -> Result<Vec<(usize, String)>> {
    let reader: Box<dyn Read> = match input {
        Some(path) if path.as_os_str() != "-" => Box::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        _ => Box::new(io::stdin()),
    };

    let mut lines = Vec::new();
    for (i, line) in BufReader::new(reader).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", i + 1))?;
        if !line.trim().is_empty() {
            lines.push((i + 1, line));
        }
    }
    Ok(lines)
}

fn print_ingest_result(result: &IngestResult, line_numbers: &[usize], verbose: u8) {
    println!("\nIngest complete:");
    println!("  Turns ingested:    {}", result.turns_ingested);
    println!("  Feedback ingested: {}", result.feedback_ingested);
    println!("  Duplicates:        {}", result.duplicates);
    println!("  Malformed:         {}", result.malformed);
    println!("  Failed:            {}", result.failed);

    if verbose >= 1 && !result.errors.is_empty() {
        println!("\nDropped records:");
        for (index, message) in &result.errors {
            let line = line_numbers.get(*index).copied().unwrap_or(index + 1);
            println!("  line {}: {}", line, message);
        }
    }
}
