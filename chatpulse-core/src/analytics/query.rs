//! Read-side queries over stored buckets.

use super::rename::IntentRenamer;
use super::report::MetricsReport;
use super::total::merge_total_view;
use crate::config::{AnalyticsConfig, Config};
use crate::db::MetricStore;
use crate::error::{Error, Result};
use crate::types::{DailyMetricBucket, DateRange};
use serde::Serialize;

/// Name accepted in place of a subject area for the total view
pub const TOTAL_TARGET: &str = "total";

/// What a query reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    SubjectArea(String),
    /// Every subject area merged per day
    Total,
}

impl std::str::FromStr for QueryTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidQuery("subject area must not be empty".to_string()));
        }
        if s.eq_ignore_ascii_case(TOTAL_TARGET) {
            Ok(QueryTarget::Total)
        } else {
            Ok(QueryTarget::SubjectArea(s.to_string()))
        }
    }
}

impl std::fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryTarget::SubjectArea(area) => write!(f, "{}", area),
            QueryTarget::Total => write!(f, "{}", TOTAL_TARGET),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub target: QueryTarget,
    pub range: DateRange,
}

/// Days in range plus their reduction
#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub target: String,
    pub range: DateRange,
    /// One entry per stored day, ascending
    pub days: Vec<DailyMetricBucket>,
    pub summary: MetricsReport,
}

/// Serves [`QueryRequest`]s from a store. Never writes.
pub struct QueryAggregator<'a, S: MetricStore + ?Sized> {
    store: &'a S,
    analytics: AnalyticsConfig,
    renamer: IntentRenamer,
}

impl<'a, S: MetricStore + ?Sized> QueryAggregator<'a, S> {
    pub fn new(store: &'a S, config: &Config) -> Self {
        Self {
            store,
            analytics: config.analytics.clone(),
            renamer: IntentRenamer::from_config(&config.analytics),
        }
    }

    /// Run a query. Any failed read aborts the whole query.
    pub fn run(&self, request: &QueryRequest) -> Result<QueryReport> {
        let days = match &request.target {
            QueryTarget::SubjectArea(area) => self.fetch_subject_area(area, &request.range)?,
            QueryTarget::Total => self.fetch_total(&request.range)?,
        };
        let summary = MetricsReport::from_buckets(&days);

        tracing::info!(
            target_area = %request.target,
            start = %request.range.start,
            end = %request.range.end,
            days = days.len(),
            "Query served"
        );

        Ok(QueryReport {
            target: request.target.to_string(),
            range: request.range,
            days,
            summary,
        })
    }

    /// Buckets of one subject area within the range, ordered by date
    pub fn fetch_subject_area(
        &self,
        subject_area: &str,
        range: &DateRange,
    ) -> Result<Vec<DailyMetricBucket>> {
        self.store.list_buckets(subject_area, range)
    }

    /// Per-day merge across the general area and every other subject area
    pub fn fetch_total(&self, range: &DateRange) -> Result<Vec<DailyMetricBucket>> {
        let general_area = self.analytics.general_subject_area.as_str();
        let general = self.fetch_subject_area(general_area, range)?;

        let mut area_buckets = Vec::new();
        for area in self.total_view_areas()? {
            area_buckets.extend(self.fetch_subject_area(&area, range)?);
        }

        Ok(merge_total_view(&general, &area_buckets, &self.renamer))
    }

    /// Subject areas merged by the total view, excluding the general area.
    ///
    /// Configured areas take precedence; otherwise every area with stored
    /// settings is used.
    pub fn total_view_areas(&self) -> Result<Vec<String>> {
        let general_area = &self.analytics.general_subject_area;
        let mut areas = if self.analytics.subject_areas.is_empty() {
            self.store.list_subject_areas()?
        } else {
            self.analytics.subject_areas.clone()
        };
        areas.retain(|area| area != general_area);
        areas.sort();
        areas.dedup();
        Ok(areas)
    }
}
