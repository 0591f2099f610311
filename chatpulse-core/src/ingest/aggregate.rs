//! Bucket update rules.
//!
//! Everything here is pure: given the current bucket and one turn (plus the
//! conversation update it caused), compute the partial update to write.
//! Storage, locking and logging live in [`super::IngestCoordinator`].

use super::conversation::ConversationUpdate;
use crate::bucketing::DayKey;
use crate::error::{Error, Result};
use crate::types::*;
use std::collections::BTreeMap;

/// One turn as seen by the bucket update
#[derive(Debug, Clone, Copy)]
pub struct TurnInput<'a> {
    pub event: &'a TurnEvent,
    pub conversation: &'a ConversationUpdate,
    pub is_fallback: bool,
}

/// Compute the partial update a turn makes to its day bucket.
///
/// Only fields whose value changes are set. Applying the result to
/// [`DailyMetricBucket::empty`] yields the document for a new bucket.
pub fn apply_turn(bucket: &DailyMetricBucket, input: &TurnInput<'_>) -> BucketPatch {
    let event = input.event;
    let conv = input.conversation;
    let conversation_id = event.session_id.as_str();
    let mut patch = BucketPatch::default();

    if conv.is_new_conversation {
        patch.num_conversations = Some(bucket.num_conversations + 1);

        let mut browsers = bucket.user_browsers.clone();
        *browsers.entry(event.device.browser.clone()).or_insert(0) += 1;
        patch.user_browsers = Some(browsers);

        if event.device.is_mobile {
            patch.mobile_conversations = Some(bucket.mobile_conversations + 1);
        } else {
            patch.non_mobile_conversations = Some(bucket.non_mobile_conversations + 1);
        }
    }

    let old_with_duration = bucket.num_conversations_with_duration;
    let with_duration = if conv.first_duration_now {
        old_with_duration + 1
    } else {
        old_with_duration
    };
    if with_duration != old_with_duration {
        patch.num_conversations_with_duration = Some(with_duration);
    }

    if conv.new_duration > 0 && conv.should_count_duration {
        let average = updated_average(
            bucket,
            conv,
            old_with_duration,
            with_duration,
        );
        if average != bucket.average_conversation_duration {
            patch.average_conversation_duration = Some(average);
        }
    }

    let mut daily_exit_intents = bucket.daily_exit_intents.clone();
    daily_exit_intents.insert(conversation_id.to_string(), event.intent.clone());
    if conv.is_new_conversation {
        patch.exit_intents = Some(recompute_exit_intents(
            &daily_exit_intents,
            conversation_id,
        ));
    }
    if daily_exit_intents != bucket.daily_exit_intents {
        patch.daily_exit_intents = Some(daily_exit_intents);
    }

    patch.intents = Some(count_intent(&bucket.intents, &event.intent, conversation_id));

    if input.is_fallback {
        patch.num_fallbacks = Some(bucket.num_fallbacks + 1);
        // Blank queries count as fallbacks but have no text to tally
        if !event.query_text.is_empty() {
            patch.fallback_triggering_queries = Some(count_fallback_query(
                &bucket.fallback_triggering_queries,
                &event.query_text,
            ));
        }
    }

    patch
}

/// Starting document for a bucket the turn is about to create.
///
/// A new conversation seeds its counters through [`apply_turn`]. A
/// conversation carried over from an earlier day still gets counted once in
/// the new day, with its device, so every bucket reflects the traffic it saw.
pub fn new_bucket_for_turn(date: DayKey, input: &TurnInput<'_>) -> DailyMetricBucket {
    let mut bucket = DailyMetricBucket::empty(date);
    if input.conversation.is_new_conversation {
        return bucket;
    }

    let device = &input.event.device;
    bucket.num_conversations = 1;
    bucket.user_browsers.insert(device.browser.clone(), 1);
    if device.is_mobile {
        bucket.mobile_conversations = 1;
    } else {
        bucket.non_mobile_conversations = 1;
    }
    bucket
}

/// Running mean over conversations with a recorded duration.
fn updated_average(
    bucket: &DailyMetricBucket,
    conv: &ConversationUpdate,
    old_with_duration: i64,
    with_duration: i64,
) -> f64 {
    let new_duration = conv.new_duration as f64;
    let old_average = bucket.average_conversation_duration;

    // First conversation of the day, or nothing to weight against
    if bucket.num_conversations <= 1 || with_duration <= 0 {
        return new_duration;
    }

    if conv.is_new_conversation || conv.first_duration_now {
        (old_average * old_with_duration as f64 + new_duration) / with_duration as f64
    } else {
        // Revision of an already counted conversation: same denominator
        let delta = conv.duration_delta() as f64;
        (old_average * old_with_duration as f64 + delta) / with_duration as f64
    }
}

/// Exit-intent counts over every tracked conversation except `starting`.
///
/// A brand-new conversation is taken to mean the others are closed, with
/// their latest intent as their exit. The list is rebuilt from scratch each
/// time, so earlier exits of conversations no longer tracked today are
/// dropped.
pub fn recompute_exit_intents(
    daily_exit_intents: &BTreeMap<String, Intent>,
    starting: &str,
) -> Vec<ExitIntentStat> {
    let mut exits: Vec<ExitIntentStat> = Vec::new();
    for (conversation_id, intent) in daily_exit_intents {
        if conversation_id == starting || intent.name.is_empty() {
            continue;
        }
        match exits.iter_mut().find(|e| e.name == intent.name) {
            Some(existing) => existing.exits += 1,
            None => exits.push(ExitIntentStat {
                id: intent.id.clone(),
                name: intent.name.clone(),
                exits: 1,
            }),
        }
    }
    exits
}

fn count_intent(intents: &[IntentStat], intent: &Intent, conversation_id: &str) -> Vec<IntentStat> {
    let mut intents = intents.to_vec();
    match intents.iter_mut().find(|i| i.id == intent.id) {
        Some(stat) => {
            stat.occurrences += 1;
            if stat.conversations.insert(conversation_id.to_string()) {
                stat.sessions += 1;
            }
        }
        None => intents.push(IntentStat {
            id: intent.id.clone(),
            name: intent.name.clone(),
            display_name: None,
            occurrences: 1,
            sessions: 1,
            conversations: [conversation_id.to_string()].into_iter().collect(),
        }),
    }
    intents
}

fn count_fallback_query(queries: &[FallbackQueryStat], query_text: &str) -> Vec<FallbackQueryStat> {
    let mut queries = queries.to_vec();
    match queries.iter_mut().find(|q| q.query_text == query_text) {
        Some(stat) => stat.occurrences += 1,
        None => queries.push(FallbackQueryStat {
            query_text: query_text.to_string(),
            occurrences: 1,
        }),
    }
    queries
}

/// Compute the feedback update for a submission.
pub fn apply_feedback(bucket: &DailyMetricBucket, event: &FeedbackEvent) -> BucketPatch {
    let mut feedback = bucket.feedback.clone();
    let details = if event.helpful {
        feedback.positive += 1;
        &mut feedback.helpful
    } else {
        feedback.negative += 1;
        &mut feedback.not_helpful
    };

    for option in &event.options {
        match details.iter_mut().find(|d| &d.name == option) {
            Some(detail) => detail.occurrences += 1,
            None => details.push(FeedbackDetail {
                name: option.clone(),
                occurrences: 1,
            }),
        }
    }

    BucketPatch {
        feedback: Some(feedback),
        ..Default::default()
    }
}

// ============================================
// Invariant checks
// ============================================

/// Hard invariant violations of a bucket.
pub fn invariant_violations(bucket: &DailyMetricBucket) -> Vec<String> {
    let mut violations = Vec::new();

    let counters = [
        ("num_conversations", bucket.num_conversations),
        (
            "num_conversations_with_duration",
            bucket.num_conversations_with_duration,
        ),
        ("num_fallbacks", bucket.num_fallbacks),
        ("mobile_conversations", bucket.mobile_conversations),
        ("non_mobile_conversations", bucket.non_mobile_conversations),
        ("feedback.positive", bucket.feedback.positive),
        ("feedback.negative", bucket.feedback.negative),
    ];
    for (name, value) in counters {
        if value < 0 {
            violations.push(format!("{} is negative ({})", name, value));
        }
    }

    if bucket.num_conversations_with_duration > bucket.num_conversations {
        violations.push(format!(
            "num_conversations_with_duration ({}) exceeds num_conversations ({})",
            bucket.num_conversations_with_duration, bucket.num_conversations
        ));
    }

    let average = bucket.average_conversation_duration;
    if !average.is_finite() || average < 0.0 {
        violations.push(format!("average_conversation_duration is {}", average));
    }

    for intent in &bucket.intents {
        if intent.occurrences < 0 || intent.sessions < 0 {
            violations.push(format!("intent {} has negative counts", intent.id));
        }
        if intent.sessions > intent.occurrences {
            violations.push(format!(
                "intent {} has more sessions ({}) than occurrences ({})",
                intent.id, intent.sessions, intent.occurrences
            ));
        }
    }

    for (browser, count) in &bucket.user_browsers {
        if *count < 0 {
            violations.push(format!("browser {} count is negative", browser));
        }
    }

    violations
}

/// Invariants that legitimately break in practice and are only reported.
///
/// Conversations carried over from the previous day get exits without
/// being counted in today's `num_conversations`.
pub fn soft_warnings(bucket: &DailyMetricBucket) -> Vec<String> {
    let exits: i64 = bucket.exit_intents.iter().map(|e| e.exits).sum();
    if exits > bucket.num_conversations {
        vec![format!(
            "exit intents total ({}) exceeds num_conversations ({})",
            exits, bucket.num_conversations
        )]
    } else {
        vec![]
    }
}

/// Allow a write unless it adds hard invariant violations.
pub fn check_write(
    key: &BucketKey,
    before: &DailyMetricBucket,
    after: &DailyMetricBucket,
) -> Result<()> {
    let existing = invariant_violations(before);
    let resulting = invariant_violations(after);

    if !existing.is_empty() {
        tracing::warn!(
            subject_area = %key.subject_area,
            day = %key.day,
            violations = ?existing,
            "Bucket already violates invariants"
        );
    }

    if resulting.len() > existing.len() {
        return Err(Error::InconsistentBucket {
            subject_area: key.subject_area.clone(),
            day: key.day.to_string(),
            message: resulting.join("; "),
        });
    }

    for warning in soft_warnings(after) {
        tracing::debug!(
            subject_area = %key.subject_area,
            day = %key.day,
            warning = %warning,
            "Soft bucket invariant exceeded"
        );
    }

    Ok(())
}
