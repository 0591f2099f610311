//! Integration tests for the ingest and query pipeline
//!
//! These tests replay `tests/fixtures/events.jsonl` through the ingest
//! coordinator and verify what the query side reads back.

use chatpulse_core::analytics::{QueryAggregator, QueryRequest, QueryTarget};
use chatpulse_core::db::{Database, MetricStore};
use chatpulse_core::ingest::{IngestCoordinator, IngestResult, InboundRecord};
use chatpulse_core::types::*;
use chatpulse_core::{Config, DayKey, Error, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

/// Get the path to a fixture file
fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn fixture_records() -> Vec<Result<InboundRecord>> {
    let content = std::fs::read_to_string(fixture_path("events.jsonl")).unwrap();
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(InboundRecord::from_json)
        .collect()
}

fn ingest_fixture<S: MetricStore>(coordinator: &IngestCoordinator<S>) -> IngestResult {
    coordinator.ingest_all(fixture_records())
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

fn march(start: u32, end: u32) -> DateRange {
    DateRange::new(date(start), date(end)).unwrap()
}

fn memory_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    db
}

// ============================================
// Ingest
// ============================================

#[test]
fn test_fixture_ingest_summary() {
    let coordinator = IngestCoordinator::new(memory_db(), &Config::default());
    let result = ingest_fixture(&coordinator);

    assert_eq!(result.turns_ingested, 9);
    assert_eq!(result.feedback_ingested, 1);
    assert_eq!(result.duplicates, 1);
    assert_eq!(result.malformed, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].0, 10);
}

#[test]
fn test_general_bucket_after_ingest() {
    let coordinator = IngestCoordinator::new(memory_db(), &Config::default());
    ingest_fixture(&coordinator);

    let key = BucketKey::new("general", DayKey::from_date(date(1)));
    let bucket = coordinator.store().get_bucket(&key).unwrap().unwrap();

    assert_eq!(bucket.num_conversations, 2);
    assert_eq!(bucket.num_conversations_with_duration, 1);
    assert_eq!(bucket.average_conversation_duration, 60.0);
    assert_eq!(bucket.user_browsers["Chrome"], 1);
    assert_eq!(bucket.user_browsers["Safari"], 1);
    assert_eq!(bucket.mobile_conversations, 1);
    assert_eq!(bucket.non_mobile_conversations, 1);

    let welcome = bucket.intent("w1").unwrap();
    assert_eq!((welcome.occurrences, welcome.sessions), (3, 2));

    // S2 starting closed S1 on its welcome turn
    assert_eq!(bucket.exit_intents.len(), 1);
    assert_eq!(bucket.exit_intents[0].name, "Default Welcome Intent");
    assert_eq!(bucket.exit_intents[0].exits, 1);

    // Path-style session ids are reduced to their last segment
    let conversation = coordinator
        .store()
        .get_conversation("general", "S1")
        .unwrap()
        .unwrap();
    assert_eq!(conversation.duration, 60);
    assert!(conversation.duration_counted);
}

#[test]
fn test_subject_area_buckets_after_ingest() {
    let coordinator = IngestCoordinator::new(memory_db(), &Config::default());
    ingest_fixture(&coordinator);

    let housing = coordinator
        .store()
        .get_bucket(&BucketKey::new("housing", DayKey::from_date(date(1))))
        .unwrap()
        .unwrap();
    assert_eq!(housing.num_conversations, 2);
    assert_eq!(housing.num_fallbacks, 1);
    assert_eq!(housing.fallback_triggering_queries[0].query_text, "blorp");
    assert_eq!(housing.exit_intents[0].name, "Default Fallback Intent");
    assert_eq!(housing.feedback.positive, 1);
    assert_eq!(housing.feedback.helpful[0].name, "Quick answer");

    let conversation = coordinator
        .store()
        .get_conversation("housing", "S1")
        .unwrap()
        .unwrap();
    assert_eq!(conversation.fallback_triggering_query, "blorp");

    let requests = coordinator.store().list_requests("housing", "S1").unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].message_text, "how do I apply");
    assert_eq!(requests[1].confidence, Some(0.3));
}

#[test]
fn test_settings_created_for_every_area() {
    let coordinator = IngestCoordinator::new(memory_db(), &Config::default());
    ingest_fixture(&coordinator);

    assert_eq!(
        coordinator.store().list_subject_areas().unwrap(),
        vec!["family", "general", "housing"]
    );
}

// ============================================
// Queries
// ============================================

#[test]
fn test_subject_area_query() {
    let config = Config::default();
    let coordinator = IngestCoordinator::new(memory_db(), &config);
    ingest_fixture(&coordinator);

    let aggregator = QueryAggregator::new(coordinator.store(), &config);
    let report = aggregator
        .run(&QueryRequest {
            target: "housing".parse().unwrap(),
            range: march(1, 31),
        })
        .unwrap();

    assert_eq!(report.target, "housing");
    assert_eq!(report.days.len(), 1);
    assert_eq!(report.summary.num_conversations, 2);
    assert_eq!(report.summary.average_conversation_duration, 60.0);
    assert_eq!(report.summary.intents["h-apply"].occurrences, 2);
    assert_eq!(report.summary.intents["h-apply"].sessions, 2);
    assert_eq!(report.summary.fallback_queries["blorp"], 1);
}

#[test]
fn test_total_view_query() {
    let config = Config::default();
    let coordinator = IngestCoordinator::new(memory_db(), &config);
    ingest_fixture(&coordinator);

    let aggregator = QueryAggregator::new(coordinator.store(), &config);
    let report = aggregator
        .run(&QueryRequest {
            target: QueryTarget::Total,
            range: march(1, 2),
        })
        .unwrap();

    assert_eq!(report.days.len(), 2);
    let first = &report.days[0];
    // Conversation counts come from the general area
    assert_eq!(first.num_conversations, 2);
    assert_eq!(first.num_fallbacks, 2);
    assert_eq!(first.feedback.positive, 1);

    let summary = &report.summary;
    assert_eq!(summary.num_conversations, 3);
    assert_eq!(summary.num_conversations_with_duration, 1);
    assert_eq!(summary.intents["no-content"].occurrences, 2);
    assert_eq!(summary.intents["apply-housing"].occurrences, 2);
    assert_eq!(summary.intents["custody"].occurrences, 1);
    assert!(!summary.intents.contains_key("welcome-home"));
    assert_eq!(summary.fallback_queries["blorp"], 2);
    assert_eq!(summary.user_browsers["Firefox"], 1);
}

#[test]
fn test_total_view_uses_configured_areas() {
    let mut config = Config::default();
    config.analytics.subject_areas = vec!["family".to_string()];
    let coordinator = IngestCoordinator::new(memory_db(), &config);
    ingest_fixture(&coordinator);

    let aggregator = QueryAggregator::new(coordinator.store(), &config);
    assert_eq!(aggregator.total_view_areas().unwrap(), vec!["family"]);

    let days = aggregator.fetch_total(&march(1, 1)).unwrap();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].num_fallbacks, 1);
    assert!(days[0].intents.iter().all(|i| i.id != "h-apply"));
}

#[test]
fn test_query_outside_range_is_empty() {
    let config = Config::default();
    let coordinator = IngestCoordinator::new(memory_db(), &config);
    ingest_fixture(&coordinator);

    let aggregator = QueryAggregator::new(coordinator.store(), &config);
    let report = aggregator
        .run(&QueryRequest {
            target: QueryTarget::SubjectArea("general".to_string()),
            range: march(10, 12),
        })
        .unwrap();
    assert!(report.days.is_empty());
    assert_eq!(report.summary.average_conversation_duration, 0.0);
}

// ============================================
// Persistence
// ============================================

#[test]
fn test_reopen_database_keeps_buckets() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("data/metrics.db");
    let config = Config::default();

    {
        let db = Database::open(&db_path).unwrap();
        db.migrate().unwrap();
        let coordinator = IngestCoordinator::new(db, &config);
        ingest_fixture(&coordinator);
    }

    let db = Database::open(&db_path).unwrap();
    db.migrate().unwrap();

    // Replaying the same file is a no-op thanks to event ids
    let coordinator = IngestCoordinator::new(db, &config);
    let replay = ingest_fixture(&coordinator);
    assert_eq!(replay.turns_ingested, 0);
    assert_eq!(replay.duplicates, 10);
    // Feedback carries no event id and is applied again
    assert_eq!(replay.feedback_ingested, 1);

    let bucket = coordinator
        .store()
        .get_bucket(&BucketKey::new("general", DayKey::from_date(date(1))))
        .unwrap()
        .unwrap();
    assert_eq!(bucket.num_conversations, 2);
    assert_eq!(bucket.intent("w1").unwrap().occurrences, 3);
}

// ============================================
// Store failures
// ============================================

/// Database wrapper that fails bucket writes or reads on demand
struct FailingStore {
    inner: Database,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FailingStore {
    fn new() -> Self {
        Self {
            inner: memory_db(),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl MetricStore for FailingStore {
    fn get_or_create_settings(
        &self,
        subject_area: &str,
        defaults: &SubjectAreaSettings,
    ) -> Result<SubjectAreaSettings> {
        self.inner.get_or_create_settings(subject_area, defaults)
    }

    fn list_subject_areas(&self) -> Result<Vec<String>> {
        self.inner.list_subject_areas()
    }

    fn get_conversation(
        &self,
        subject_area: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationState>> {
        self.inner.get_conversation(subject_area, conversation_id)
    }

    fn put_conversation(&self, subject_area: &str, state: &ConversationState) -> Result<()> {
        self.inner.put_conversation(subject_area, state)
    }

    fn get_bucket(&self, key: &BucketKey) -> Result<Option<DailyMetricBucket>> {
        self.inner.get_bucket(key)
    }

    fn create_bucket(&self, key: &BucketKey, bucket: &DailyMetricBucket) -> Result<()> {
        Self::check(&self.fail_writes)?;
        self.inner.create_bucket(key, bucket)
    }

    fn update_bucket(&self, key: &BucketKey, patch: &BucketPatch) -> Result<()> {
        Self::check(&self.fail_writes)?;
        self.inner.update_bucket(key, patch)
    }

    fn list_buckets(
        &self,
        subject_area: &str,
        range: &DateRange,
    ) -> Result<Vec<DailyMetricBucket>> {
        Self::check(&self.fail_reads)?;
        self.inner.list_buckets(subject_area, range)
    }

    fn has_request(&self, subject_area: &str, event_id: &str) -> Result<bool> {
        self.inner.has_request(subject_area, event_id)
    }

    fn record_request(&self, subject_area: &str, record: &RequestRecord) -> Result<bool> {
        self.inner.record_request(subject_area, record)
    }
}

fn welcome_turn() -> TurnEvent {
    TurnEvent {
        session_id: "S1".to_string(),
        event_id: Some("e-1".to_string()),
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap(),
        subject_area: "general".to_string(),
        intent: Intent::new("w1", "Default Welcome Intent"),
        query_text: String::new(),
        language_code: None,
        confidence: None,
        device: Device {
            browser: "Chrome".to_string(),
            is_mobile: false,
        },
    }
}

#[test]
fn test_bucket_write_failure_drops_event() {
    let store = FailingStore::new();
    store.fail_writes.store(true, Ordering::SeqCst);
    let coordinator = IngestCoordinator::new(store, &Config::default());

    let err = coordinator.ingest(&welcome_turn()).unwrap_err();
    assert!(err.is_store_failure());

    // Nothing reached the bucket or the request log, so the event can be replayed
    let key = BucketKey::new("general", DayKey::from_date(date(1)));
    assert!(coordinator.store().get_bucket(&key).unwrap().is_none());
    assert!(!coordinator.store().has_request("general", "e-1").unwrap());

    // Without recorded event ids the repeated turn is attempted again too
    let result = ingest_fixture(&coordinator);
    assert_eq!(result.turns_ingested, 0);
    assert_eq!(result.duplicates, 0);
    assert_eq!(result.failed, 11);
    assert_eq!(result.malformed, 1);
}

#[test]
fn test_failed_read_aborts_whole_query() {
    let store = FailingStore::new();
    let config = Config::default();
    let coordinator = IngestCoordinator::new(store, &config);
    ingest_fixture(&coordinator);

    coordinator.store().fail_reads.store(true, Ordering::SeqCst);
    let aggregator = QueryAggregator::new(coordinator.store(), &config);
    let result = aggregator.run(&QueryRequest {
        target: QueryTarget::Total,
        range: march(1, 2),
    });
    assert!(matches!(result, Err(Error::StoreUnavailable(_))));
}

#[test]
fn test_invalid_range_rejected() {
    assert!(matches!(
        DateRange::new(date(5), date(1)),
        Err(Error::InvalidQuery(_))
    ));
}
