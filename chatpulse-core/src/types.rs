//! Core domain types for chatpulse
//!
//! These types describe what the engine reads and writes: validated turn
//! events, per-conversation state, and the per-day metric buckets.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Subject area** | A topic partition of the conversational system with its own settings and buckets |
//! | **Conversation** | One continuous session with an end user, identified by a session id |
//! | **Turn** | One inbound message-processing cycle, carrying the matched intent |
//! | **Fallback intent** | The "did not understand" intent, tracked for unhandled-query analysis |
//! | **Exit intent** | The last intent seen for a conversation before it is considered closed |
//! | **Bucket** | The aggregate document for one (subject area, calendar day) |

use crate::bucketing::DayKey;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================
// Events
// ============================================

/// An intent as matched by the conversational agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub name: String,
}

impl Intent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Device descriptors reported by the chat client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub browser: String,
    pub is_mobile: bool,
}

/// A validated per-turn event.
///
/// Built from [`crate::ingest::RawTurnEvent`] at the boundary; every field the
/// aggregation arithmetic depends on is guaranteed present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnEvent {
    /// Conversation (session) identifier
    pub session_id: String,
    /// Delivery identifier, used to drop redelivered events
    pub event_id: Option<String>,
    /// When the turn happened
    pub timestamp: DateTime<Utc>,
    pub subject_area: String,
    pub intent: Intent,
    /// Raw user query text (may be empty)
    pub query_text: String,
    pub language_code: Option<String>,
    /// Intent detection confidence in [0, 1]
    pub confidence: Option<f64>,
    pub device: Device,
}

/// A validated end-of-conversation feedback submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub subject_area: String,
    /// Whether the user found the conversation helpful
    pub helpful: bool,
    /// Option labels the user selected
    pub options: Vec<String>,
}

// ============================================
// Subject area settings
// ============================================

/// Reporting timezone of a subject area (fixed UTC offset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timezone {
    pub name: String,
    pub offset_hours: f64,
}

impl Timezone {
    /// The offset as a chrono [`FixedOffset`], clamped to the valid range.
    pub fn fixed_offset(&self) -> FixedOffset {
        fixed_offset_from_hours(self.offset_hours)
    }
}

/// Convert an hour offset into a [`FixedOffset`].
///
/// Non-finite values map to UTC; values beyond ±23:59 are clamped.
pub fn fixed_offset_from_hours(offset_hours: f64) -> FixedOffset {
    const MAX_SECS: i32 = 24 * 3600 - 60;
    let secs = if offset_hours.is_finite() {
        ((offset_hours * 3600.0).round() as i64).clamp(-(MAX_SECS as i64), MAX_SECS as i64) as i32
    } else {
        0
    };
    FixedOffset::east_opt(secs).unwrap_or_else(|| Utc.fix())
}

/// Per-subject-area settings document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectAreaSettings {
    pub timezone: Timezone,
    pub primary_color: String,
}

// ============================================
// Conversation state
// ============================================

/// Durable per-conversation record, one per (subject area, session id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: String,
    /// Timestamp of the first turn; never changes
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent turn
    pub updated_at: DateTime<Utc>,
    pub last_intent: Intent,
    /// Seconds since creation, as of the latest same-day turn
    pub duration: i64,
    /// Flips to true the first time a duration is recorded; never reset
    pub duration_counted: bool,
    pub browser: String,
    pub is_mobile: bool,
    /// Query text of the latest non-empty fallback turn
    pub fallback_triggering_query: String,
}

// ============================================
// Daily metric buckets
// ============================================

/// Key of a bucket document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub subject_area: String,
    pub day: DayKey,
}

impl BucketKey {
    pub fn new(subject_area: impl Into<String>, day: DayKey) -> Self {
        Self {
            subject_area: subject_area.into(),
            day,
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subject_area, self.day)
    }
}

/// Frequency entry for one intent within a bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentStat {
    pub id: String,
    pub name: String,
    /// Normalized display name, set by cross-area merges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Every turn that matched this intent
    pub occurrences: i64,
    /// Distinct conversations that matched this intent
    pub sessions: i64,
    /// Conversations already counted in `sessions`
    #[serde(default)]
    pub conversations: BTreeSet<String>,
}

/// Number of closed conversations whose last intent was this one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitIntentStat {
    pub id: String,
    pub name: String,
    pub exits: i64,
}

/// Tally of one query text that triggered the fallback intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackQueryStat {
    pub query_text: String,
    pub occurrences: i64,
}

/// Tally of one feedback option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackDetail {
    pub name: String,
    pub occurrences: i64,
}

/// Feedback counters for a bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackTally {
    pub positive: i64,
    pub negative: i64,
    #[serde(default)]
    pub helpful: Vec<FeedbackDetail>,
    #[serde(default)]
    pub not_helpful: Vec<FeedbackDetail>,
}

/// Aggregate statistics for one subject area on one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricBucket {
    pub date: DayKey,
    pub num_conversations: i64,
    pub num_conversations_with_duration: i64,
    /// Mean duration in seconds over `num_conversations_with_duration`
    pub average_conversation_duration: f64,
    pub intents: Vec<IntentStat>,
    /// Conversation id -> intent of its latest turn today
    pub daily_exit_intents: BTreeMap<String, Intent>,
    pub exit_intents: Vec<ExitIntentStat>,
    pub num_fallbacks: i64,
    pub fallback_triggering_queries: Vec<FallbackQueryStat>,
    pub user_browsers: BTreeMap<String, i64>,
    pub mobile_conversations: i64,
    pub non_mobile_conversations: i64,
    #[serde(default)]
    pub feedback: FeedbackTally,
}

impl DailyMetricBucket {
    /// An all-zero bucket for the given day
    pub fn empty(date: DayKey) -> Self {
        Self {
            date,
            num_conversations: 0,
            num_conversations_with_duration: 0,
            average_conversation_duration: 0.0,
            intents: vec![],
            daily_exit_intents: BTreeMap::new(),
            exit_intents: vec![],
            num_fallbacks: 0,
            fallback_triggering_queries: vec![],
            user_browsers: BTreeMap::new(),
            mobile_conversations: 0,
            non_mobile_conversations: 0,
            feedback: FeedbackTally::default(),
        }
    }

    /// Look up an intent entry by intent id
    pub fn intent(&self, intent_id: &str) -> Option<&IntentStat> {
        self.intents.iter().find(|i| i.id == intent_id)
    }
}

/// Partial update of a bucket: only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketPatch {
    pub num_conversations: Option<i64>,
    pub num_conversations_with_duration: Option<i64>,
    pub average_conversation_duration: Option<f64>,
    pub intents: Option<Vec<IntentStat>>,
    pub daily_exit_intents: Option<BTreeMap<String, Intent>>,
    pub exit_intents: Option<Vec<ExitIntentStat>>,
    pub num_fallbacks: Option<i64>,
    pub fallback_triggering_queries: Option<Vec<FallbackQueryStat>>,
    pub user_browsers: Option<BTreeMap<String, i64>>,
    pub mobile_conversations: Option<i64>,
    pub non_mobile_conversations: Option<i64>,
    pub feedback: Option<FeedbackTally>,
}

impl BucketPatch {
    pub fn is_empty(&self) -> bool {
        *self == BucketPatch::default()
    }

    /// Names of the fields this patch writes (for logging)
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.num_conversations.is_some() {
            names.push("num_conversations");
        }
        if self.num_conversations_with_duration.is_some() {
            names.push("num_conversations_with_duration");
        }
        if self.average_conversation_duration.is_some() {
            names.push("average_conversation_duration");
        }
        if self.intents.is_some() {
            names.push("intents");
        }
        if self.daily_exit_intents.is_some() {
            names.push("daily_exit_intents");
        }
        if self.exit_intents.is_some() {
            names.push("exit_intents");
        }
        if self.num_fallbacks.is_some() {
            names.push("num_fallbacks");
        }
        if self.fallback_triggering_queries.is_some() {
            names.push("fallback_triggering_queries");
        }
        if self.user_browsers.is_some() {
            names.push("user_browsers");
        }
        if self.mobile_conversations.is_some() {
            names.push("mobile_conversations");
        }
        if self.non_mobile_conversations.is_some() {
            names.push("non_mobile_conversations");
        }
        if self.feedback.is_some() {
            names.push("feedback");
        }
        names
    }

    /// Apply the patch to an in-memory bucket
    pub fn apply_to(&self, bucket: &mut DailyMetricBucket) {
        if let Some(v) = self.num_conversations {
            bucket.num_conversations = v;
        }
        if let Some(v) = self.num_conversations_with_duration {
            bucket.num_conversations_with_duration = v;
        }
        if let Some(v) = self.average_conversation_duration {
            bucket.average_conversation_duration = v;
        }
        if let Some(v) = &self.intents {
            bucket.intents = v.clone();
        }
        if let Some(v) = &self.daily_exit_intents {
            bucket.daily_exit_intents = v.clone();
        }
        if let Some(v) = &self.exit_intents {
            bucket.exit_intents = v.clone();
        }
        if let Some(v) = self.num_fallbacks {
            bucket.num_fallbacks = v;
        }
        if let Some(v) = &self.fallback_triggering_queries {
            bucket.fallback_triggering_queries = v.clone();
        }
        if let Some(v) = &self.user_browsers {
            bucket.user_browsers = v.clone();
        }
        if let Some(v) = self.mobile_conversations {
            bucket.mobile_conversations = v;
        }
        if let Some(v) = self.non_mobile_conversations {
            bucket.non_mobile_conversations = v;
        }
        if let Some(v) = &self.feedback {
            bucket.feedback = v.clone();
        }
    }
}

// ============================================
// Request log
// ============================================

/// One ingested turn, kept for export and duplicate detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub conversation_id: String,
    pub event_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub language: Option<String>,
    pub intent: Intent,
    pub confidence: Option<f64>,
    pub message_text: String,
}

impl From<&TurnEvent> for RequestRecord {
    fn from(event: &TurnEvent) -> Self {
        Self {
            conversation_id: event.session_id.clone(),
            event_id: event.event_id.clone(),
            received_at: event.timestamp,
            language: event.language_code.clone(),
            intent: event.intent.clone(),
            confidence: event.confidence,
            message_text: event.query_text.clone(),
        }
    }
}

// ============================================
// Queries
// ============================================

/// Inclusive range of calendar days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> crate::error::Result<Self> {
        if start > end {
            return Err(crate::error::Error::InvalidQuery(format!(
                "range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// A single-day range
    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}
