//! Reduction of daily buckets into a single summary.
//!
//! A [`MetricsReport`] can absorb buckets one at a time or merge with
//! another report; both operations are associative and commutative, so a
//! range may be reduced in any order or in pieces.

use crate::types::{DailyMetricBucket, FeedbackDetail, FeedbackTally, IntentStat};
use serde::Serialize;
use std::collections::BTreeMap;

/// Intent totals across the reduced range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentSummary {
    pub name: String,
    pub display_name: String,
    pub occurrences: i64,
    pub sessions: i64,
}

/// Exit totals for one intent name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitSummary {
    pub id: String,
    pub name: String,
    pub exits: i64,
}

/// Feedback totals, details keyed by normalized option name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackSummary {
    pub positive: i64,
    pub negative: i64,
    pub helpful: BTreeMap<String, FeedbackDetail>,
    pub not_helpful: BTreeMap<String, FeedbackDetail>,
}

impl FeedbackSummary {
    fn absorb(&mut self, tally: &FeedbackTally) {
        self.positive += tally.positive;
        self.negative += tally.negative;
        for detail in &tally.helpful {
            add_detail(&mut self.helpful, detail);
        }
        for detail in &tally.not_helpful {
            add_detail(&mut self.not_helpful, detail);
        }
    }

    fn merge(&mut self, other: &FeedbackSummary) {
        self.positive += other.positive;
        self.negative += other.negative;
        for detail in other.helpful.values() {
            add_detail(&mut self.helpful, detail);
        }
        for detail in other.not_helpful.values() {
            add_detail(&mut self.not_helpful, detail);
        }
    }
}

/// Summary statistics over a set of daily buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsReport {
    /// Number of buckets reduced
    pub days: usize,
    pub num_conversations: i64,
    pub num_conversations_with_duration: i64,
    /// Mean over conversations with a duration, weighted by day
    pub average_conversation_duration: f64,
    /// Keyed by display name, or intent id when no display name is set
    pub intents: BTreeMap<String, IntentSummary>,
    /// Keyed by intent name
    pub exit_intents: BTreeMap<String, ExitSummary>,
    pub num_fallbacks: i64,
    /// Query text -> occurrences
    pub fallback_queries: BTreeMap<String, i64>,
    pub user_browsers: BTreeMap<String, i64>,
    pub mobile_conversations: i64,
    pub non_mobile_conversations: i64,
    pub feedback: FeedbackSummary,
    /// Σ(average × count) over absorbed days
    #[serde(skip)]
    weighted_duration: f64,
}

impl MetricsReport {
    /// Reduce a sequence of buckets
    pub fn from_buckets<'a, I>(buckets: I) -> Self
    where
        I: IntoIterator<Item = &'a DailyMetricBucket>,
    {
        let mut report = Self::default();
        for bucket in buckets {
            report.absorb(bucket);
        }
        report
    }

    /// Add one day's bucket to the report
    pub fn absorb(&mut self, bucket: &DailyMetricBucket) {
        self.days += 1;
        self.num_conversations += bucket.num_conversations;
        self.num_conversations_with_duration += bucket.num_conversations_with_duration;
        self.weighted_duration +=
            bucket.average_conversation_duration * bucket.num_conversations_with_duration as f64;
        self.refresh_average();

        for intent in &bucket.intents {
            self.add_intent(intent);
        }

        for exit in &bucket.exit_intents {
            add_exit(
                &mut self.exit_intents,
                &ExitSummary {
                    id: exit.id.clone(),
                    name: exit.name.clone(),
                    exits: exit.exits,
                },
            );
        }

        self.num_fallbacks += bucket.num_fallbacks;
        for query in &bucket.fallback_triggering_queries {
            if query.query_text.is_empty() {
                continue;
            }
            *self
                .fallback_queries
                .entry(query.query_text.clone())
                .or_insert(0) += query.occurrences;
        }

        for (browser, count) in &bucket.user_browsers {
            *self.user_browsers.entry(browser.clone()).or_insert(0) += count;
        }
        self.mobile_conversations += bucket.mobile_conversations;
        self.non_mobile_conversations += bucket.non_mobile_conversations;

        self.feedback.absorb(&bucket.feedback);
    }

    /// Combine with another report covering disjoint buckets
    pub fn merge(&mut self, other: &MetricsReport) {
        self.days += other.days;
        self.num_conversations += other.num_conversations;
        self.num_conversations_with_duration += other.num_conversations_with_duration;
        self.weighted_duration += other.weighted_duration;
        self.refresh_average();

        for (key, intent) in &other.intents {
            merge_intent(&mut self.intents, key, intent);
        }
        for exit in other.exit_intents.values() {
            add_exit(&mut self.exit_intents, exit);
        }

        self.num_fallbacks += other.num_fallbacks;
        for (text, count) in &other.fallback_queries {
            *self.fallback_queries.entry(text.clone()).or_insert(0) += count;
        }

        for (browser, count) in &other.user_browsers {
            *self.user_browsers.entry(browser.clone()).or_insert(0) += count;
        }
        self.mobile_conversations += other.mobile_conversations;
        self.non_mobile_conversations += other.non_mobile_conversations;

        self.feedback.merge(&other.feedback);
    }

    /// Intents ordered by occurrences (descending), then display name
    pub fn top_intents(&self, limit: usize) -> Vec<&IntentSummary> {
        let mut intents: Vec<&IntentSummary> = self.intents.values().collect();
        intents.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        intents.truncate(limit);
        intents
    }

    /// Exit intents ordered by exits (descending), then name
    pub fn top_exit_intents(&self, limit: usize) -> Vec<&ExitSummary> {
        let mut exits: Vec<&ExitSummary> = self.exit_intents.values().collect();
        exits.sort_by(|a, b| b.exits.cmp(&a.exits).then_with(|| a.name.cmp(&b.name)));
        exits.truncate(limit);
        exits
    }

    fn refresh_average(&mut self) {
        self.average_conversation_duration = if self.num_conversations_with_duration > 0 {
            self.weighted_duration / self.num_conversations_with_duration as f64
        } else {
            0.0
        };
    }

    fn add_intent(&mut self, intent: &IntentStat) {
        let display_name = intent
            .display_name
            .clone()
            .unwrap_or_else(|| intent.id.clone());
        let summary = IntentSummary {
            name: intent.name.clone(),
            display_name: display_name.clone(),
            occurrences: intent.occurrences,
            sessions: intent.sessions,
        };
        merge_intent(&mut self.intents, &display_name, &summary);
    }
}

/// Feedback option names are matched with whitespace runs replaced by `-`
pub fn normalize_feedback_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("-")
}

fn merge_intent(intents: &mut BTreeMap<String, IntentSummary>, key: &str, intent: &IntentSummary) {
    match intents.get_mut(key) {
        Some(existing) => {
            existing.occurrences += intent.occurrences;
            existing.sessions += intent.sessions;
            // Smallest raw name wins so the result does not depend on order
            if intent.name < existing.name {
                existing.name = intent.name.clone();
            }
        }
        None => {
            intents.insert(key.to_string(), intent.clone());
        }
    }
}

fn add_exit(exits: &mut BTreeMap<String, ExitSummary>, exit: &ExitSummary) {
    match exits.get_mut(&exit.name) {
        Some(existing) => {
            existing.exits += exit.exits;
            if exit.id < existing.id {
                existing.id = exit.id.clone();
            }
        }
        None => {
            exits.insert(exit.name.clone(), exit.clone());
        }
    }
}

fn add_detail(details: &mut BTreeMap<String, FeedbackDetail>, detail: &FeedbackDetail) {
    let key = normalize_feedback_name(&detail.name);
    match details.get_mut(&key) {
        Some(existing) => {
            existing.occurrences += detail.occurrences;
            if detail.name < existing.name {
                existing.name = detail.name.clone();
            }
        }
        None => {
            details.insert(key, detail.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucketing::DayKey;
    use crate::types::{ExitIntentStat, FallbackQueryStat};
    use chrono::NaiveDate;

    fn bucket(day: u32, conversations: i64, with_duration: i64, average: f64) -> DailyMetricBucket {
        let mut b = DailyMetricBucket::empty(DayKey::from_date(
            NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
        ));
        b.num_conversations = conversations;
        b.num_conversations_with_duration = with_duration;
        b.average_conversation_duration = average;
        b
    }

    fn sample_buckets() -> Vec<DailyMetricBucket> {
        let mut a = bucket(1, 4, 2, 30.0);
        a.intents.push(IntentStat {
            id: "i-1".to_string(),
            name: "faq-1".to_string(),
            display_name: None,
            occurrences: 3,
            sessions: 2,
            conversations: Default::default(),
        });
        a.exit_intents.push(ExitIntentStat {
            id: "i-1".to_string(),
            name: "faq-1".to_string(),
            exits: 2,
        });
        a.fallback_triggering_queries.push(FallbackQueryStat {
            query_text: "blorp".to_string(),
            occurrences: 1,
        });
        a.fallback_triggering_queries.push(FallbackQueryStat {
            query_text: String::new(),
            occurrences: 5,
        });
        a.feedback.positive = 1;
        a.feedback.helpful.push(FeedbackDetail {
            name: "Very  fast".to_string(),
            occurrences: 1,
        });

        let mut b = bucket(2, 2, 1, 90.0);
        b.intents.push(IntentStat {
            id: "i-1".to_string(),
            name: "faq-1".to_string(),
            display_name: None,
            occurrences: 1,
            sessions: 1,
            conversations: Default::default(),
        });
        b.exit_intents.push(ExitIntentStat {
            id: "i-9".to_string(),
            name: "faq-1".to_string(),
            exits: 1,
        });
        b.feedback.helpful.push(FeedbackDetail {
            name: "Very fast".to_string(),
            occurrences: 2,
        });

        let mut c = bucket(3, 3, 3, 10.0);
        c.user_browsers.insert("Chrome".to_string(), 3);
        c.fallback_triggering_queries.push(FallbackQueryStat {
            query_text: "blorp".to_string(),
            occurrences: 2,
        });
        c.feedback.negative = 2;

        vec![a, b, c]
    }

    #[test]
    fn test_weighted_average() {
        let report = MetricsReport::from_buckets(&sample_buckets());
        assert_eq!(report.days, 3);
        assert_eq!(report.num_conversations, 9);
        assert_eq!(report.num_conversations_with_duration, 6);
        // (30*2 + 90*1 + 10*3) / 6
        assert!((report.average_conversation_duration - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report_has_zero_average() {
        let report = MetricsReport::from_buckets(&[bucket(1, 2, 0, 0.0)]);
        assert_eq!(report.average_conversation_duration, 0.0);
    }

    #[test]
    fn test_sums_by_key() {
        let report = MetricsReport::from_buckets(&sample_buckets());

        let faq = &report.intents["i-1"];
        assert_eq!((faq.occurrences, faq.sessions), (4, 3));

        let exit = &report.exit_intents["faq-1"];
        assert_eq!(exit.exits, 3);
        assert_eq!(exit.id, "i-1");

        assert_eq!(report.fallback_queries.len(), 1);
        assert_eq!(report.fallback_queries["blorp"], 3);

        assert_eq!(report.feedback.positive, 1);
        assert_eq!(report.feedback.negative, 2);
        assert_eq!(report.feedback.helpful["Very-fast"].occurrences, 3);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let buckets = sample_buckets();
        let all = MetricsReport::from_buckets(&buckets);

        let mut split = MetricsReport::from_buckets(&buckets[..2]);
        split.merge(&MetricsReport::from_buckets(&buckets[2..]));

        let mut reversed = MetricsReport::from_buckets(&buckets[2..]);
        reversed.merge(&MetricsReport::from_buckets(buckets[..2].iter().rev()));

        for report in [&split, &reversed] {
            assert_eq!(report.days, all.days);
            assert_eq!(report.intents, all.intents);
            assert_eq!(report.exit_intents, all.exit_intents);
            assert_eq!(report.fallback_queries, all.fallback_queries);
            assert_eq!(report.feedback, all.feedback);
            assert_eq!(report.user_browsers, all.user_browsers);
            assert_eq!(report.num_conversations, all.num_conversations);
            assert!(
                (report.average_conversation_duration - all.average_conversation_duration).abs()
                    < 1e-9
            );
        }
    }

    #[test]
    fn test_top_intents_ordering() {
        let mut report = MetricsReport::default();
        for (key, occurrences) in [("b", 2), ("a", 2), ("c", 5)] {
            report.intents.insert(
                key.to_string(),
                IntentSummary {
                    name: key.to_string(),
                    display_name: key.to_string(),
                    occurrences,
                    sessions: 1,
                },
            );
        }
        let names: Vec<&str> = report
            .top_intents(2)
            .iter()
            .map(|i| i.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn test_normalize_feedback_name() {
        assert_eq!(normalize_feedback_name("Too   slow\tto answer"), "Too-slow-to-answer");
        assert_eq!(normalize_feedback_name("Fast"), "Fast");
    }
}
