//! Total view: one merged bucket per day across subject areas.
//!
//! Intent, exit, fallback and feedback figures are the union of the
//! subject areas. Conversation, duration and device figures come from the
//! reserved general area only, which records top-level entry into the
//! system rather than per-topic activity.

use super::rename::IntentRenamer;
use super::report::normalize_feedback_name;
use crate::bucketing::DayKey;
use crate::types::*;
use std::collections::BTreeMap;

/// Merge buckets per calendar day.
///
/// `general` holds the general area's buckets, `subject_areas` the buckets
/// of every other area in the range. The result is ordered by date and
/// contains a day if either side has a bucket for it.
pub fn merge_total_view(
    general: &[DailyMetricBucket],
    subject_areas: &[DailyMetricBucket],
    renamer: &IntentRenamer,
) -> Vec<DailyMetricBucket> {
    let mut days: BTreeMap<DayKey, DayMerge> = BTreeMap::new();

    for bucket in subject_areas {
        days.entry(bucket.date)
            .or_insert_with(|| DayMerge::new(bucket.date))
            .absorb_area(bucket, renamer);
    }

    for bucket in general {
        days.entry(bucket.date)
            .or_insert_with(|| DayMerge::new(bucket.date))
            .general = Some(bucket.clone());
    }

    days.into_values().map(DayMerge::finish).collect()
}

struct DayMerge {
    date: DayKey,
    intents: BTreeMap<String, IntentStat>,
    exits: BTreeMap<String, ExitIntentStat>,
    num_fallbacks: i64,
    queries: BTreeMap<String, i64>,
    positive: i64,
    negative: i64,
    helpful: BTreeMap<String, FeedbackDetail>,
    not_helpful: BTreeMap<String, FeedbackDetail>,
    general: Option<DailyMetricBucket>,
}

impl DayMerge {
    fn new(date: DayKey) -> Self {
        Self {
            date,
            intents: BTreeMap::new(),
            exits: BTreeMap::new(),
            num_fallbacks: 0,
            queries: BTreeMap::new(),
            positive: 0,
            negative: 0,
            helpful: BTreeMap::new(),
            not_helpful: BTreeMap::new(),
            general: None,
        }
    }

    fn absorb_area(&mut self, bucket: &DailyMetricBucket, renamer: &IntentRenamer) {
        for intent in &bucket.intents {
            let display_name = renamer.display_name(&intent.name);
            let entry = self
                .intents
                .entry(display_name.clone())
                .or_insert_with(|| IntentStat {
                    id: intent.id.clone(),
                    name: intent.name.clone(),
                    display_name: Some(display_name),
                    occurrences: 0,
                    // Distinct conversations cannot be recovered across areas
                    sessions: 0,
                    conversations: Default::default(),
                });
            entry.occurrences += intent.occurrences;
            if intent.id < entry.id {
                entry.id = intent.id.clone();
                entry.name = intent.name.clone();
            }
        }

        for exit in &bucket.exit_intents {
            let entry = self
                .exits
                .entry(exit.name.clone())
                .or_insert_with(|| ExitIntentStat {
                    id: exit.id.clone(),
                    name: exit.name.clone(),
                    exits: 0,
                });
            entry.exits += exit.exits;
            if exit.id < entry.id {
                entry.id = exit.id.clone();
            }
        }

        self.num_fallbacks += bucket.num_fallbacks;
        for query in &bucket.fallback_triggering_queries {
            *self.queries.entry(query.query_text.clone()).or_insert(0) += query.occurrences;
        }

        self.positive += bucket.feedback.positive;
        self.negative += bucket.feedback.negative;
        merge_details(&mut self.helpful, &bucket.feedback.helpful);
        merge_details(&mut self.not_helpful, &bucket.feedback.not_helpful);
    }

    fn finish(self) -> DailyMetricBucket {
        let mut bucket = DailyMetricBucket::empty(self.date);

        if let Some(general) = self.general {
            bucket.num_conversations = general.num_conversations;
            bucket.num_conversations_with_duration = general.num_conversations_with_duration;
            bucket.average_conversation_duration = general.average_conversation_duration;
            bucket.mobile_conversations = general.mobile_conversations;
            bucket.non_mobile_conversations = general.non_mobile_conversations;
            bucket.user_browsers = general.user_browsers;
        }

        bucket.intents = self.intents.into_values().collect();
        bucket.exit_intents = self.exits.into_values().collect();
        bucket.num_fallbacks = self.num_fallbacks;
        bucket.fallback_triggering_queries = self
            .queries
            .into_iter()
            .map(|(query_text, occurrences)| FallbackQueryStat {
                query_text,
                occurrences,
            })
            .collect();
        bucket.feedback = FeedbackTally {
            positive: self.positive,
            negative: self.negative,
            helpful: self.helpful.into_values().collect(),
            not_helpful: self.not_helpful.into_values().collect(),
        };
        bucket
    }
}

fn merge_details(merged: &mut BTreeMap<String, FeedbackDetail>, details: &[FeedbackDetail]) {
    for detail in details {
        let key = normalize_feedback_name(&detail.name);
        match merged.get_mut(&key) {
            Some(existing) => existing.occurrences += detail.occurrences,
            None => {
                merged.insert(key, detail.clone());
            }
        }
    }
}
