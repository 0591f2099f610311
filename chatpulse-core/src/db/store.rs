//! Storage seam used by ingestion and querying.
//!
//! [`Database`] is the production implementation. Tests substitute stores
//! that fail on demand to exercise error propagation.

use super::repo::Database;
use crate::error::Result;
use crate::types::*;

/// Key-value document access needed by the aggregation engine.
///
/// Implementations must be safe to share across threads; the ingest
/// coordinator serializes writers per bucket but not per store.
pub trait MetricStore: Send + Sync {
    /// Settings for a subject area, writing `defaults` on first reference
    fn get_or_create_settings(
        &self,
        subject_area: &str,
        defaults: &SubjectAreaSettings,
    ) -> Result<SubjectAreaSettings>;

    /// Every subject area with stored settings
    fn list_subject_areas(&self) -> Result<Vec<String>>;

    fn get_conversation(
        &self,
        subject_area: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationState>>;

    fn put_conversation(&self, subject_area: &str, state: &ConversationState) -> Result<()>;

    fn get_bucket(&self, key: &BucketKey) -> Result<Option<DailyMetricBucket>>;

    /// Write a complete document for a bucket that does not exist yet
    fn create_bucket(&self, key: &BucketKey, bucket: &DailyMetricBucket) -> Result<()>;

    /// Write only the fields set in the patch
    fn update_bucket(&self, key: &BucketKey, patch: &BucketPatch) -> Result<()>;

    /// Buckets of one subject area within the range, ascending by date
    fn list_buckets(&self, subject_area: &str, range: &DateRange)
        -> Result<Vec<DailyMetricBucket>>;

    fn has_request(&self, subject_area: &str, event_id: &str) -> Result<bool>;

    /// Returns false if the event id was already recorded
    fn record_request(&self, subject_area: &str, record: &RequestRecord) -> Result<bool>;
}

impl MetricStore for Database {
    fn get_or_create_settings(
        &self,
        subject_area: &str,
        defaults: &SubjectAreaSettings,
    ) -> Result<SubjectAreaSettings> {
        Database::get_or_create_settings(self, subject_area, defaults)
    }

    fn list_subject_areas(&self) -> Result<Vec<String>> {
        Database::list_subject_areas(self)
    }

    fn get_conversation(
        &self,
        subject_area: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationState>> {
        Database::get_conversation(self, subject_area, conversation_id)
    }

    fn put_conversation(&self, subject_area: &str, state: &ConversationState) -> Result<()> {
        Database::put_conversation(self, subject_area, state)
    }

    fn get_bucket(&self, key: &BucketKey) -> Result<Option<DailyMetricBucket>> {
        Database::get_bucket(self, key)
    }

    fn create_bucket(&self, key: &BucketKey, bucket: &DailyMetricBucket) -> Result<()> {
        Database::create_bucket(self, key, bucket)
    }

    fn update_bucket(&self, key: &BucketKey, patch: &BucketPatch) -> Result<()> {
        Database::update_bucket(self, key, patch)
    }

    fn list_buckets(
        &self,
        subject_area: &str,
        range: &DateRange,
    ) -> Result<Vec<DailyMetricBucket>> {
        Database::list_buckets(self, subject_area, range)
    }

    fn has_request(&self, subject_area: &str, event_id: &str) -> Result<bool> {
        Database::has_request(self, subject_area, event_id)
    }

    fn record_request(&self, subject_area: &str, record: &RequestRecord) -> Result<bool> {
        Database::record_request(self, subject_area, record)
    }
}

impl<S: MetricStore + ?Sized> MetricStore for std::sync::Arc<S> {
    fn get_or_create_settings(
        &self,
        subject_area: &str,
        defaults: &SubjectAreaSettings,
    ) -> Result<SubjectAreaSettings> {
        (**self).get_or_create_settings(subject_area, defaults)
    }

    fn list_subject_areas(&self) -> Result<Vec<String>> {
        (**self).list_subject_areas()
    }

    fn get_conversation(
        &self,
        subject_area: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationState>> {
        (**self).get_conversation(subject_area, conversation_id)
    }

    fn put_conversation(&self, subject_area: &str, state: &ConversationState) -> Result<()> {
        (**self).put_conversation(subject_area, state)
    }

    fn get_bucket(&self, key: &BucketKey) -> Result<Option<DailyMetricBucket>> {
        (**self).get_bucket(key)
    }

    fn create_bucket(&self, key: &BucketKey, bucket: &DailyMetricBucket) -> Result<()> {
        (**self).create_bucket(key, bucket)
    }

    fn update_bucket(&self, key: &BucketKey, patch: &BucketPatch) -> Result<()> {
        (**self).update_bucket(key, patch)
    }

    fn list_buckets(
        &self,
        subject_area: &str,
        range: &DateRange,
    ) -> Result<Vec<DailyMetricBucket>> {
        (**self).list_buckets(subject_area, range)
    }

    fn has_request(&self, subject_area: &str, event_id: &str) -> Result<bool> {
        (**self).has_request(subject_area, event_id)
    }

    fn record_request(&self, subject_area: &str, record: &RequestRecord) -> Result<bool> {
        (**self).record_request(subject_area, record)
    }
}
