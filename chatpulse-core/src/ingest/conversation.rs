//! Per-conversation state tracking.
//!
//! Each turn advances the conversation record of its session: last intent,
//! device, fallback query, and the running duration used by the bucket
//! average. Durations are only measured while the turn falls on the same
//! calendar day (subject-area time) as the conversation's first turn.

use crate::bucketing::same_day;
use crate::db::MetricStore;
use crate::error::Result;
use crate::types::{ConversationState, SubjectAreaSettings, TurnEvent};

/// Outcome of applying one turn to a conversation record
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationUpdate {
    /// State after the turn, as persisted
    pub state: ConversationState,
    /// No record existed before this turn
    pub is_new_conversation: bool,
    /// This turn recorded the conversation's first duration
    pub first_duration_now: bool,
    /// The turn is on the conversation's starting day
    pub should_count_duration: bool,
    /// Duration in seconds after this turn
    pub new_duration: i64,
    /// Duration in seconds before this turn
    pub previous_duration: i64,
}

impl ConversationUpdate {
    /// Change of the recorded duration caused by this turn
    pub fn duration_delta(&self) -> i64 {
        self.new_duration - self.previous_duration
    }
}

/// Compute the next conversation state for a turn without touching storage.
///
/// Durations never shrink: a turn delivered out of order keeps the larger,
/// already recorded duration.
pub fn advance(
    previous: Option<&ConversationState>,
    event: &TurnEvent,
    timezone_offset_hours: f64,
    is_fallback: bool,
) -> ConversationUpdate {
    let fallback_query = |current: &str| {
        if is_fallback && !event.query_text.is_empty() {
            event.query_text.clone()
        } else {
            current.to_string()
        }
    };

    let Some(previous) = previous else {
        let state = ConversationState {
            id: event.session_id.clone(),
            created_at: event.timestamp,
            updated_at: event.timestamp,
            last_intent: event.intent.clone(),
            duration: 0,
            duration_counted: false,
            browser: event.device.browser.clone(),
            is_mobile: event.device.is_mobile,
            fallback_triggering_query: fallback_query(""),
        };
        return ConversationUpdate {
            state,
            is_new_conversation: true,
            first_duration_now: false,
            should_count_duration: true,
            new_duration: 0,
            previous_duration: 0,
        };
    };

    let should_count_duration = same_day(
        event.timestamp,
        previous.created_at,
        timezone_offset_hours,
    );
    let previous_duration = previous.duration;

    let mut state = previous.clone();
    state.updated_at = state.updated_at.max(event.timestamp);
    state.last_intent = event.intent.clone();
    state.browser = event.device.browser.clone();
    state.is_mobile = event.device.is_mobile;
    state.fallback_triggering_query = fallback_query(&previous.fallback_triggering_query);

    let mut first_duration_now = false;
    let mut new_duration = previous_duration;
    if should_count_duration {
        let elapsed = (event.timestamp - previous.created_at).num_seconds();
        new_duration = elapsed.max(previous_duration);
        first_duration_now = !previous.duration_counted;
        state.duration = new_duration;
        state.duration_counted = true;
    }

    ConversationUpdate {
        state,
        is_new_conversation: false,
        first_duration_now,
        should_count_duration,
        new_duration,
        previous_duration,
    }
}

/// Conversation records of one store
pub struct ConversationStore<'a, S: MetricStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: MetricStore + ?Sized> ConversationStore<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn get(&self, subject_area: &str, conversation_id: &str) -> Result<Option<ConversationState>> {
        self.store.get_conversation(subject_area, conversation_id)
    }

    /// Compute the conversation update for a turn without writing it.
    pub fn prepare(
        &self,
        event: &TurnEvent,
        settings: &SubjectAreaSettings,
        is_fallback: bool,
    ) -> Result<ConversationUpdate> {
        let previous = self.get(&event.subject_area, &event.session_id)?;
        Ok(advance(
            previous.as_ref(),
            event,
            settings.timezone.offset_hours,
            is_fallback,
        ))
    }

    /// Persist a prepared update.
    pub fn save(&self, subject_area: &str, update: &ConversationUpdate) -> Result<()> {
        self.store.put_conversation(subject_area, &update.state)?;

        tracing::debug!(
            subject_area = %subject_area,
            conversation_id = %update.state.id,
            is_new = update.is_new_conversation,
            should_count_duration = update.should_count_duration,
            duration = update.new_duration,
            "Conversation updated"
        );
        Ok(())
    }

    /// Apply a turn to its conversation record and persist the result.
    pub fn create_or_update(
        &self,
        event: &TurnEvent,
        settings: &SubjectAreaSettings,
        is_fallback: bool,
    ) -> Result<ConversationUpdate> {
        let update = self.prepare(event, settings, is_fallback)?;
        self.save(&event.subject_area, &update)?;
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::{Device, Intent};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn turn(at: DateTime<Utc>, intent: &str, query: &str) -> TurnEvent {
        TurnEvent {
            session_id: "s1".to_string(),
            event_id: None,
            timestamp: at,
            subject_area: "general".to_string(),
            intent: Intent::new(format!("id-{}", intent), intent),
            query_text: query.to_string(),
            language_code: None,
            confidence: None,
            device: Device {
                browser: "Chrome".to_string(),
                is_mobile: false,
            },
        }
    }

    fn start() -> DateTime<Utc> {
        // 10:00 at UTC-7
        Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap()
    }

    #[test]
    fn test_new_conversation() {
        let update = advance(None, &turn(start(), "welcome", ""), -7.0, false);
        assert!(update.is_new_conversation);
        assert!(!update.first_duration_now);
        assert_eq!(update.state.created_at, start());
        assert_eq!(update.state.duration, 0);
        assert!(!update.state.duration_counted);
    }

    #[test]
    fn test_first_duration_then_revision() {
        let first = advance(None, &turn(start(), "welcome", ""), -7.0, false);

        let second = advance(
            Some(&first.state),
            &turn(start() + Duration::seconds(30), "faq-1", ""),
            -7.0,
            false,
        );
        assert!(second.should_count_duration);
        assert!(second.first_duration_now);
        assert_eq!(second.new_duration, 30);
        assert_eq!(second.previous_duration, 0);
        assert!(second.state.duration_counted);

        let third = advance(
            Some(&second.state),
            &turn(start() + Duration::seconds(60), "faq-1", ""),
            -7.0,
            false,
        );
        assert!(!third.first_duration_now);
        assert_eq!(third.new_duration, 60);
        assert_eq!(third.duration_delta(), 30);
        assert_eq!(third.state.last_intent.name, "faq-1");
    }

    #[test]
    fn test_cross_midnight_does_not_count() {
        // 23:58 at UTC-7
        let late = Utc.with_ymd_and_hms(2024, 3, 2, 6, 58, 0).unwrap();
        let first = advance(None, &turn(late, "welcome", ""), -7.0, false);

        let next = advance(
            Some(&first.state),
            &turn(late + Duration::minutes(7), "faq-1", ""),
            -7.0,
            false,
        );
        assert!(!next.should_count_duration);
        assert!(!next.first_duration_now);
        assert_eq!(next.new_duration, 0);
        assert!(!next.state.duration_counted);
        assert_eq!(next.state.last_intent.name, "faq-1");
    }

    #[test]
    fn test_out_of_order_turn_keeps_duration() {
        let first = advance(None, &turn(start(), "welcome", ""), -7.0, false);
        let later = advance(
            Some(&first.state),
            &turn(start() + Duration::seconds(90), "faq-1", ""),
            -7.0,
            false,
        );
        let stale = advance(
            Some(&later.state),
            &turn(start() + Duration::seconds(40), "faq-2", ""),
            -7.0,
            false,
        );
        assert_eq!(stale.new_duration, 90);
        assert_eq!(stale.duration_delta(), 0);
        assert_eq!(stale.state.updated_at, start() + Duration::seconds(90));
    }

    #[test]
    fn test_fallback_query_recorded_only_when_present() {
        let first = advance(None, &turn(start(), "fallback", "gibberish"), -7.0, true);
        assert_eq!(first.state.fallback_triggering_query, "gibberish");

        let empty = advance(
            Some(&first.state),
            &turn(start() + Duration::seconds(5), "fallback", ""),
            -7.0,
            true,
        );
        assert_eq!(empty.state.fallback_triggering_query, "gibberish");

        let normal = advance(
            Some(&empty.state),
            &turn(start() + Duration::seconds(9), "faq-1", "apply"),
            -7.0,
            false,
        );
        assert_eq!(normal.state.fallback_triggering_query, "gibberish");
    }

    #[test]
    fn test_store_persists_state() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let settings = crate::config::SettingsDefaults::default().to_settings();
        let conversations = ConversationStore::new(&db);

        conversations
            .create_or_update(&turn(start(), "welcome", ""), &settings, false)
            .unwrap();
        let update = conversations
            .create_or_update(
                &turn(start() + Duration::seconds(45), "faq-1", ""),
                &settings,
                false,
            )
            .unwrap();
        assert!(!update.is_new_conversation);

        let stored = conversations.get("general", "s1").unwrap().unwrap();
        assert_eq!(stored.duration, 45);
        assert!(stored.duration_counted);
    }
}
