//! chatpulse-report - query daily metrics for a subject area or the total view
//!
//! Reads buckets in a date range and prints their reduction. Never writes
//! to the database.

use anyhow::{Context, Result};
use chatpulse_core::{
    Config, Database, DateRange, DayKey, MetricsReport, QueryAggregator, QueryReport,
    QueryRequest, QueryTarget,
};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chatpulse-report")]
#[command(about = "Report daily conversation metrics")]
#[command(version)]
struct Args {
    /// Subject area to report on, or "total" for every area merged per day
    target: String,

    /// First day of the range (YYYY-MM-DD or MM-DD-YYYY)
    #[arg(long, value_parser = parse_day)]
    start: NaiveDate,

    /// Last day of the range, inclusive (defaults to --start)
    #[arg(long, value_parser = parse_day)]
    end: Option<NaiveDate>,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Number of intents to list in text output
    #[arg(long, default_value = "10")]
    top: usize,

    /// Also print one line per day in text output
    #[arg(long)]
    daily: bool,

    /// Database path (defaults to the XDG data directory)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file (defaults to the XDG config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn parse_day(s: &str) -> std::result::Result<NaiveDate, String> {
    DayKey::parse(s)
        .map(|day| day.date())
        .ok_or_else(|| format!("invalid date '{}': expected YYYY-MM-DD or MM-DD-YYYY", s))
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.format != "text" && args.format != "json" {
        anyhow::bail!("unknown format '{}': expected text or json", args.format);
    }

    Config::ensure_xdg_env();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let _log_guard =
        chatpulse_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = args.db.clone().unwrap_or_else(Config::database_path);
    if !db_path.exists() {
        anyhow::bail!(
            "no database at {}; run chatpulse-ingest first",
            db_path.display()
        );
    }
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let target: QueryTarget = args.target.parse().context("invalid report target")?;
    let range = DateRange::new(args.start, args.end.unwrap_or(args.start))
        .context("invalid date range")?;

    let aggregator = QueryAggregator::new(&db, &config);
    let report = aggregator
        .run(&QueryRequest { target, range })
        .context("query failed")?;

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, args.top, args.daily);
    }

    Ok(())
}

fn print_report(report: &QueryReport, top: usize, daily: bool) {
    let summary = &report.summary;

    println!(
        "Report: {}  {} .. {}  ({} day(s) with data)",
        report.target,
        DayKey::from_date(report.range.start),
        DayKey::from_date(report.range.end),
        summary.days
    );

    if summary.days == 0 {
        println!("\nNo metrics recorded in this range.");
        return;
    }

    println!("\nConversations:");
    println!("  Total:            {}", summary.num_conversations);
    println!("  With duration:    {}", summary.num_conversations_with_duration);
    println!(
        "  Average duration: {:.1}s",
        summary.average_conversation_duration
    );
    println!("  Mobile:           {}", summary.mobile_conversations);
    println!("  Non-mobile:       {}", summary.non_mobile_conversations);

    if !summary.user_browsers.is_empty() {
        println!("\nBrowsers:");
        for (browser, count) in &summary.user_browsers {
            println!("  {:<20} {}", browser, count);
        }
    }

    print_intents(summary, top);

    println!("\nFallbacks: {}", summary.num_fallbacks);
    for (query, count) in &summary.fallback_queries {
        println!("  {:?}: {}", query, count);
    }

    let feedback = &summary.feedback;
    println!(
        "\nFeedback: {} helpful, {} not helpful",
        feedback.positive, feedback.negative
    );
    for detail in feedback.helpful.values() {
        println!("  + {}: {}", detail.name, detail.occurrences);
    }
    for detail in feedback.not_helpful.values() {
        println!("  - {}: {}", detail.name, detail.occurrences);
    }

    if daily {
        println!("\nDaily:");
        for day in &report.days {
            println!(
                "  {}  conversations {:>5}  avg {:>8.1}s  fallbacks {:>4}",
                day.date,
                day.num_conversations,
                day.average_conversation_duration,
                day.num_fallbacks
            );
        }
    }
}

fn print_intents(summary: &MetricsReport, top: usize) {
    let intents = summary.top_intents(top);
    if !intents.is_empty() {
        println!("\nTop intents:");
        for intent in intents {
            let label = if intent.display_name == intent.name {
                intent.display_name.clone()
            } else {
                format!("{} ({})", intent.display_name, intent.name)
            };
            println!(
                "  {:<40} {:>6} occurrences  {:>5} sessions",
                label, intent.occurrences, intent.sessions
            );
        }
    }

    let exits = summary.top_exit_intents(top);
    if !exits.is_empty() {
        println!("\nExit intents:");
        for exit in exits {
            println!("  {:<32} {:>6}", exit.name, exit.exits);
        }
    }
}
