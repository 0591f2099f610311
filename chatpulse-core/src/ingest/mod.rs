//! Ingestion layer turning per-turn events into daily metric buckets
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────────┐
//! │  Inbound JSON   │ ──► │ IngestCoordinator│ ──► │     MetricStore     │
//! │ (turn/feedback) │     │                  │     │ (settings, convos,  │
//! └─────────────────┘     └──────────────────┘     │  buckets, requests) │
//!                               │                  └─────────────────────┘
//!                               ▼
//!                    ┌──────────────────────┐
//!                    │ ConversationStore    │
//!                    │ aggregate::apply_turn│
//!                    └──────────────────────┘
//! ```
//!
//! Each turn resolves its subject area's settings, advances the
//! conversation record, then applies one read-modify-write cycle to the
//! `(subject area, day)` bucket. Cycles on the same bucket are serialized
//! inside the process; different buckets proceed independently.
//!
//! Reads and invariant checks run before the first write, so a turn
//! rejected as `InconsistentBucket` changes nothing. The conversation
//! write, the bucket write and the request-log append are still separate
//! store calls: a store failure between them leaves the earlier writes in
//! place.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chatpulse_core::{Config, Database, IngestCoordinator};
//!
//! let config = Config::load()?;
//! let db = Database::open(&Config::database_path())?;
//! db.migrate()?;
//!
//! let coordinator = IngestCoordinator::new(db, &config);
//! coordinator.ingest(&event)?;
//! ```

pub mod aggregate;
pub mod conversation;
pub mod event;

pub use conversation::{ConversationStore, ConversationUpdate};
pub use event::{Inbound, InboundRecord, RawFeedbackEvent, RawTurnEvent};

use crate::bucketing::{day_key, DayKey};
use crate::config::{AnalyticsConfig, Config};
use crate::db::MetricStore;
use crate::error::{Error, Result};
use crate::types::*;
use aggregate::TurnInput;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Prune idle bucket locks once the map grows past this size
const LOCK_MAP_PRUNE_THRESHOLD: usize = 1024;

/// What happened to a single inbound record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Applied to its bucket
    Ingested,
    /// Event id already recorded; nothing written
    Duplicate,
}

/// Summary of a batch ingest.
#[derive(Debug, Default)]
pub struct IngestResult {
    /// Turn events applied
    pub turns_ingested: usize,
    /// Feedback submissions applied
    pub feedback_ingested: usize,
    /// Records skipped because their event id was already recorded
    pub duplicates: usize,
    /// Records dropped as malformed
    pub malformed: usize,
    /// Records dropped because the store or a bucket invariant rejected them
    pub failed: usize,
    /// Errors encountered (record index → error message)
    pub errors: Vec<(usize, String)>,
}

impl IngestResult {
    /// Records that were applied to a bucket
    pub fn ingested(&self) -> usize {
        self.turns_ingested + self.feedback_ingested
    }

    /// Records that were dropped
    pub fn dropped(&self) -> usize {
        self.malformed + self.failed
    }
}

/// A checked bucket write, ready to persist
enum BucketWrite {
    Update(BucketPatch),
    Create(DailyMetricBucket),
}

/// Applies inbound events to a [`MetricStore`].
pub struct IngestCoordinator<S: MetricStore> {
    store: S,
    analytics: AnalyticsConfig,
    defaults: SubjectAreaSettings,
    bucket_locks: Mutex<HashMap<BucketKey, Arc<Mutex<()>>>>,
}

impl<S: MetricStore> IngestCoordinator<S> {
    /// Create a coordinator writing to `store`.
    pub fn new(store: S, config: &Config) -> Self {
        Self {
            store,
            analytics: config.analytics.clone(),
            defaults: config.defaults.to_settings(),
            bucket_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply one turn event.
    ///
    /// Store and invariant failures abort the ingest for this event; the
    /// error is logged with enough context to replay it and returned.
    pub fn ingest(&self, event: &TurnEvent) -> Result<IngestOutcome> {
        let mut day = None;
        let result = self.ingest_turn(event, &mut day);
        if let Err(e) = &result {
            tracing::error!(
                subject_area = %event.subject_area,
                day = %day.map(|d| d.to_string()).unwrap_or_default(),
                conversation_id = %event.session_id,
                event_id = event.event_id.as_deref().unwrap_or(""),
                error = %e,
                "Turn ingest failed, event dropped"
            );
        }
        result
    }

    fn ingest_turn(
        &self,
        event: &TurnEvent,
        day: &mut Option<DayKey>,
    ) -> Result<IngestOutcome> {
        let settings = self
            .store
            .get_or_create_settings(&event.subject_area, &self.defaults)?;
        let key = BucketKey::new(
            event.subject_area.as_str(),
            day_key(event.timestamp, settings.timezone.offset_hours),
        );
        *day = Some(key.day);

        let lock = self.bucket_lock(&key)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::StoreUnavailable(format!("bucket lock poisoned for {}", key)))?;

        if let Some(event_id) = &event.event_id {
            if self.store.has_request(&event.subject_area, event_id)? {
                tracing::debug!(
                    subject_area = %event.subject_area,
                    event_id = %event_id,
                    "Duplicate event skipped"
                );
                return Ok(IngestOutcome::Duplicate);
            }
        }

        let is_fallback = self.analytics.is_fallback_intent(&event.intent.name);
        let conversations = ConversationStore::new(&self.store);
        let update = conversations.prepare(event, &settings, is_fallback)?;

        let input = TurnInput {
            event,
            conversation: &update,
            is_fallback,
        };
        // Checked before anything is written, so a rejected turn leaves
        // the conversation as it was
        let write = self.prepare_bucket_write(
            &key,
            || aggregate::new_bucket_for_turn(key.day, &input),
            |bucket| aggregate::apply_turn(bucket, &input),
        )?;

        conversations.save(&event.subject_area, &update)?;
        self.commit_bucket_write(&key, write)?;
        self.store
            .record_request(&event.subject_area, &RequestRecord::from(event))?;

        tracing::debug!(
            subject_area = %key.subject_area,
            day = %key.day,
            conversation_id = %event.session_id,
            intent = %event.intent.name,
            is_new_conversation = update.is_new_conversation,
            "Turn ingested"
        );
        Ok(IngestOutcome::Ingested)
    }

    /// Apply one feedback submission.
    pub fn ingest_feedback(&self, event: &FeedbackEvent) -> Result<IngestOutcome> {
        let mut day = None;
        let result = self.ingest_feedback_inner(event, &mut day);
        if let Err(e) = &result {
            tracing::error!(
                subject_area = %event.subject_area,
                day = %day.map(|d| d.to_string()).unwrap_or_default(),
                conversation_id = %event.session_id,
                error = %e,
                "Feedback ingest failed, event dropped"
            );
        }
        result
    }

    fn ingest_feedback_inner(
        &self,
        event: &FeedbackEvent,
        day: &mut Option<DayKey>,
    ) -> Result<IngestOutcome> {
        let settings = self
            .store
            .get_or_create_settings(&event.subject_area, &self.defaults)?;
        let key = BucketKey::new(
            event.subject_area.as_str(),
            day_key(event.timestamp, settings.timezone.offset_hours),
        );
        *day = Some(key.day);

        let lock = self.bucket_lock(&key)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::StoreUnavailable(format!("bucket lock poisoned for {}", key)))?;

        let write = self.prepare_bucket_write(
            &key,
            || DailyMetricBucket::empty(key.day),
            |bucket| aggregate::apply_feedback(bucket, event),
        )?;
        self.commit_bucket_write(&key, write)?;

        tracing::debug!(
            subject_area = %key.subject_area,
            day = %key.day,
            conversation_id = %event.session_id,
            helpful = event.helpful,
            "Feedback ingested"
        );
        Ok(IngestOutcome::Ingested)
    }

    /// Validate and apply one inbound record.
    pub fn ingest_record(&self, record: InboundRecord) -> Result<IngestOutcome> {
        match record.validate()? {
            Inbound::Turn(event) => self.ingest(&event),
            Inbound::Feedback(event) => self.ingest_feedback(&event),
        }
    }

    /// Apply a sequence of records, continuing past failures.
    pub fn ingest_all<I>(&self, records: I) -> IngestResult
    where
        I: IntoIterator<Item = Result<InboundRecord>>,
    {
        self.ingest_all_with_progress(records, |_| {})
    }

    /// Apply a sequence of records with a progress callback.
    ///
    /// The callback receives the index of each record after it has been
    /// processed. Malformed records and failed ingests are counted and
    /// recorded in [`IngestResult::errors`]; they never stop the batch.
    pub fn ingest_all_with_progress<I, F>(&self, records: I, mut on_progress: F) -> IngestResult
    where
        I: IntoIterator<Item = Result<InboundRecord>>,
        F: FnMut(usize),
    {
        let mut result = IngestResult::default();

        for (i, record) in records.into_iter().enumerate() {
            let inbound = record.and_then(InboundRecord::validate);
            match inbound {
                Ok(Inbound::Turn(event)) => match self.ingest(&event) {
                    Ok(IngestOutcome::Ingested) => result.turns_ingested += 1,
                    Ok(IngestOutcome::Duplicate) => result.duplicates += 1,
                    Err(e) => {
                        result.failed += 1;
                        result.errors.push((i, e.to_string()));
                    }
                },
                Ok(Inbound::Feedback(event)) => match self.ingest_feedback(&event) {
                    Ok(IngestOutcome::Ingested) => result.feedback_ingested += 1,
                    Ok(IngestOutcome::Duplicate) => result.duplicates += 1,
                    Err(e) => {
                        result.failed += 1;
                        result.errors.push((i, e.to_string()));
                    }
                },
                Err(e) => {
                    tracing::warn!(record = i, error = %e, "Malformed record dropped");
                    result.malformed += 1;
                    result.errors.push((i, e.to_string()));
                }
            }
            on_progress(i);
        }

        tracing::info!(
            turns = result.turns_ingested,
            feedback = result.feedback_ingested,
            duplicates = result.duplicates,
            dropped = result.dropped(),
            "Batch ingest complete"
        );
        result
    }

    /// Read the bucket (or start a new one), compute the update and check
    /// invariants. Nothing is written.
    fn prepare_bucket_write<N, F>(
        &self,
        key: &BucketKey,
        new_bucket: N,
        compute: F,
    ) -> Result<BucketWrite>
    where
        N: FnOnce() -> DailyMetricBucket,
        F: FnOnce(&DailyMetricBucket) -> BucketPatch,
    {
        match self.store.get_bucket(key)? {
            Some(before) => {
                let patch = compute(&before);
                let mut after = before.clone();
                patch.apply_to(&mut after);
                aggregate::check_write(key, &before, &after)?;
                Ok(BucketWrite::Update(patch))
            }
            None => {
                let seeded = new_bucket();
                let mut created = seeded.clone();
                compute(&seeded).apply_to(&mut created);
                aggregate::check_write(key, &seeded, &created)?;
                Ok(BucketWrite::Create(created))
            }
        }
    }

    fn commit_bucket_write(&self, key: &BucketKey, write: BucketWrite) -> Result<()> {
        match write {
            BucketWrite::Update(patch) => {
                tracing::trace!(bucket = %key, fields = ?patch.field_names(), "Updating bucket");
                self.store.update_bucket(key, &patch)
            }
            BucketWrite::Create(bucket) => {
                tracing::info!(
                    subject_area = %key.subject_area,
                    day = %key.day,
                    "Creating bucket"
                );
                self.store.create_bucket(key, &bucket)
            }
        }
    }

    /// Lock guarding read-modify-write cycles on one bucket
    fn bucket_lock(&self, key: &BucketKey) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .bucket_locks
            .lock()
            .map_err(|_| Error::StoreUnavailable("bucket lock map poisoned".to_string()))?;

        if locks.len() > LOCK_MAP_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        Ok(locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

    fn coordinator() -> IngestCoordinator<Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        IngestCoordinator::new(db, &Config::default())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap()
    }

    fn turn(session: &str, at: DateTime<Utc>, intent: &str) -> TurnEvent {
        TurnEvent {
            session_id: session.to_string(),
            event_id: None,
            timestamp: at,
            subject_area: "general".to_string(),
            intent: Intent::new(format!("id-{}", intent), intent),
            query_text: String::new(),
            language_code: Some("en".to_string()),
            confidence: Some(0.9),
            device: Device {
                browser: "Chrome".to_string(),
                is_mobile: false,
            },
        }
    }

    fn key() -> BucketKey {
        BucketKey::new(
            "general",
            DayKey::from_date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        )
    }

    #[test]
    fn test_ingest_creates_settings_and_bucket() {
        let coordinator = coordinator();
        coordinator.ingest(&turn("S1", t0(), "welcome")).unwrap();

        let settings = coordinator.store().get_settings("general").unwrap().unwrap();
        assert_eq!(settings.timezone.offset_hours, -7.0);

        let bucket = coordinator.store().get_bucket(&key()).unwrap().unwrap();
        assert_eq!(bucket.num_conversations, 1);
        assert_eq!(bucket.intent("id-welcome").unwrap().occurrences, 1);
    }

    #[test]
    fn test_duplicate_event_id_skipped() {
        let coordinator = coordinator();
        let mut event = turn("S1", t0(), "welcome");
        event.event_id = Some("resp-1".to_string());

        assert_eq!(coordinator.ingest(&event).unwrap(), IngestOutcome::Ingested);
        assert_eq!(coordinator.ingest(&event).unwrap(), IngestOutcome::Duplicate);

        let bucket = coordinator.store().get_bucket(&key()).unwrap().unwrap();
        assert_eq!(bucket.intent("id-welcome").unwrap().occurrences, 1);
        assert_eq!(coordinator.store().list_requests("general", "S1").unwrap().len(), 1);
    }

    #[test]
    fn test_ingest_all_counts_outcomes() {
        let coordinator = coordinator();
        let records = vec![
            InboundRecord::from_json(
                r#"{"sessionId": "S1", "eventId": "e1", "timestamp": "2024-03-01T17:00:00Z", "subjectArea": "general", "intent": {"id": "1", "name": "welcome"}}"#,
            ),
            InboundRecord::from_json(
                r#"{"sessionId": "S1", "eventId": "e1", "timestamp": "2024-03-01T17:00:00Z", "subjectArea": "general", "intent": {"id": "1", "name": "welcome"}}"#,
            ),
            InboundRecord::from_json(r#"{"sessionId": "S1"}"#),
            InboundRecord::from_json("not json"),
            InboundRecord::from_json(
                r#"{"sessionId": "S1", "timestamp": "2024-03-01T17:05:00Z", "subjectArea": "general", "helpful": true, "options": ["Fast"]}"#,
            ),
        ];

        let mut seen = vec![];
        let result = coordinator.ingest_all_with_progress(records, |i| seen.push(i));

        assert_eq!(result.turns_ingested, 1);
        assert_eq!(result.feedback_ingested, 1);
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.malformed, 2);
        assert_eq!(result.dropped(), 2);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let bucket = coordinator.store().get_bucket(&key()).unwrap().unwrap();
        assert_eq!(bucket.feedback.positive, 1);
        assert_eq!(bucket.feedback.helpful[0].name, "Fast");
    }

    #[test]
    fn test_feedback_creates_bucket() {
        let coordinator = coordinator();
        coordinator
            .ingest_feedback(&FeedbackEvent {
                session_id: "S9".to_string(),
                timestamp: t0(),
                subject_area: "general".to_string(),
                helpful: false,
                options: vec!["Wrong answer".to_string()],
            })
            .unwrap();

        let bucket = coordinator.store().get_bucket(&key()).unwrap().unwrap();
        assert_eq!(bucket.num_conversations, 0);
        assert_eq!(bucket.feedback.negative, 1);
        assert_eq!(bucket.feedback.not_helpful[0].occurrences, 1);
    }

    #[test]
    fn test_carried_over_conversation_seeds_new_day_bucket() {
        let coordinator = coordinator();
        // 23:58 and 00:05 at UTC-7
        let late = Utc.with_ymd_and_hms(2024, 3, 2, 6, 58, 0).unwrap();
        let mut first = turn("S1", late, "welcome");
        first.device = Device {
            browser: "Safari".to_string(),
            is_mobile: true,
        };
        let mut second = first.clone();
        second.timestamp = late + Duration::minutes(7);
        second.intent = Intent::new("id-faq-1", "faq-1");

        coordinator.ingest(&first).unwrap();
        coordinator.ingest(&second).unwrap();

        let next_day = BucketKey::new(
            "general",
            DayKey::from_date(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()),
        );
        let bucket = coordinator.store().get_bucket(&next_day).unwrap().unwrap();
        assert_eq!(bucket.num_conversations, 1);
        assert_eq!(bucket.num_conversations_with_duration, 0);
        assert_eq!(bucket.user_browsers.get("Safari"), Some(&1));
        assert_eq!(bucket.mobile_conversations, 1);
        assert_eq!(bucket.non_mobile_conversations, 0);
    }

    #[test]
    fn test_rejected_bucket_write_leaves_conversation_untouched() {
        let coordinator = coordinator();
        let store = coordinator.store();

        // A stored conversation without a duration yet, and a bucket that
        // never counted it: a first duration would exceed num_conversations
        let state = ConversationState {
            id: "S1".to_string(),
            created_at: t0(),
            updated_at: t0(),
            last_intent: Intent::new("id-welcome", "welcome"),
            duration: 0,
            duration_counted: false,
            browser: "Chrome".to_string(),
            is_mobile: false,
            fallback_triggering_query: String::new(),
        };
        store.put_conversation("general", &state).unwrap();
        store
            .create_bucket(&key(), &DailyMetricBucket::empty(key().day))
            .unwrap();

        let mut event = turn("S1", t0() + Duration::seconds(30), "faq-1");
        event.event_id = Some("resp-2".to_string());
        let result = coordinator.ingest(&event);
        assert!(matches!(result, Err(Error::InconsistentBucket { .. })));

        assert_eq!(store.get_conversation("general", "S1").unwrap(), Some(state));
        let bucket = store.get_bucket(&key()).unwrap().unwrap();
        assert_eq!(bucket.num_conversations_with_duration, 0);
        assert!(bucket.intents.is_empty());
        assert!(!store.has_request("general", "resp-2").unwrap());
    }

    #[test]
    fn test_concurrent_ingest_same_bucket() {
        let coordinator = coordinator();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let coordinator = &coordinator;
                scope.spawn(move || {
                    for n in 0..5 {
                        let session = format!("W{}-{}", worker, n);
                        let start = t0() + Duration::seconds(n);
                        coordinator.ingest(&turn(&session, start, "welcome")).unwrap();
                        coordinator
                            .ingest(&turn(&session, start + Duration::seconds(10), "faq-1"))
                            .unwrap();
                    }
                });
            }
        });

        let bucket = coordinator.store().get_bucket(&key()).unwrap().unwrap();
        assert_eq!(bucket.num_conversations, 20);
        assert_eq!(bucket.num_conversations_with_duration, 20);
        assert_eq!(bucket.intent("id-welcome").unwrap().sessions, 20);
        assert_eq!(bucket.intent("id-faq-1").unwrap().occurrences, 20);
        assert!((bucket.average_conversation_duration - 10.0).abs() < 1e-9);
        assert_eq!(bucket.user_browsers.get("Chrome"), Some(&20));
    }
}
