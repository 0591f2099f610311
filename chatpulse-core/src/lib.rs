//! # chatpulse-core
//!
//! Core library for chatpulse - incremental analytics for a conversational
//! agent.
//!
//! This library provides:
//! - Domain types for turn events, conversations, and daily metric buckets
//! - Ingestion that keeps per-day buckets up to date one turn at a time
//! - Query-side reduction of buckets, per subject area or merged across all
//! - Database storage layer with SQLite
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use chatpulse_core::{Config, Database, IngestCoordinator};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let coordinator = IngestCoordinator::new(db, &config);
//! ```

// Re-export commonly used items at the crate root
pub use analytics::{MetricsReport, QueryAggregator, QueryReport, QueryRequest, QueryTarget};
pub use bucketing::{day_key, DayKey};
pub use config::Config;
pub use db::{Database, MetricStore};
pub use error::{Error, Result};
pub use ingest::{IngestCoordinator, IngestOutcome, IngestResult, InboundRecord};
pub use types::*;

// Public modules
pub mod analytics;
pub mod bucketing;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod types;
