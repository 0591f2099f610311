//! Query-side analytics over daily metric buckets
//!
//! Buckets are read for a date range and reduced into a [`MetricsReport`].
//! The total view first merges the buckets of every subject area per day;
//! see [`total`] for which figures come from where.

pub mod query;
pub mod rename;
pub mod report;
pub mod total;

pub use query::{QueryAggregator, QueryReport, QueryRequest, QueryTarget};
pub use rename::IntentRenamer;
pub use report::{ExitSummary, FeedbackSummary, IntentSummary, MetricsReport};
