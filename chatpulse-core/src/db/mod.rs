//! Database layer for chatpulse
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for documents
//! - The [`MetricStore`] trait the engine is written against

pub mod repo;
pub mod schema;
pub mod store;

pub use repo::Database;
pub use store::MetricStore;
