//! Database repository layer
//!
//! Provides query and write operations for settings, conversation state,
//! daily metric buckets and the request log.

use crate::bucketing::DayKey;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        super::schema::run_migrations(&conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("database connection lock poisoned".to_string()))
    }

    // ============================================
    // Settings operations
    // ============================================

    /// Return the stored settings for a subject area, writing `defaults`
    /// first if the area has never been seen.
    pub fn get_or_create_settings(
        &self,
        subject_area: &str,
        defaults: &SubjectAreaSettings,
    ) -> Result<SubjectAreaSettings> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO settings
                (subject_area, timezone_name, timezone_offset_hours, primary_color, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                subject_area,
                defaults.timezone.name,
                defaults.timezone.offset_hours,
                defaults.primary_color,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if inserted > 0 {
            tracing::info!(subject_area, "Created default settings for subject area");
        }

        conn.query_row(
            "SELECT * FROM settings WHERE subject_area = ?",
            [subject_area],
            Self::row_to_settings,
        )
        .map_err(Error::from)
    }

    /// Get settings for a subject area without creating them
    pub fn get_settings(&self, subject_area: &str) -> Result<Option<SubjectAreaSettings>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM settings WHERE subject_area = ?",
            [subject_area],
            Self::row_to_settings,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Overwrite the settings of a subject area
    pub fn put_settings(&self, subject_area: &str, settings: &SubjectAreaSettings) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO settings
                (subject_area, timezone_name, timezone_offset_hours, primary_color, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(subject_area) DO UPDATE SET
                timezone_name = excluded.timezone_name,
                timezone_offset_hours = excluded.timezone_offset_hours,
                primary_color = excluded.primary_color
            "#,
            params![
                subject_area,
                settings.timezone.name,
                settings.timezone.offset_hours,
                settings.primary_color,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Every subject area with stored settings, sorted by name
    pub fn list_subject_areas(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT subject_area FROM settings ORDER BY subject_area")?;
        let areas = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(areas)
    }

    fn row_to_settings(row: &Row) -> rusqlite::Result<SubjectAreaSettings> {
        Ok(SubjectAreaSettings {
            timezone: Timezone {
                name: row.get("timezone_name")?,
                offset_hours: row.get("timezone_offset_hours")?,
            },
            primary_color: row.get("primary_color")?,
        })
    }

    // ============================================
    // Conversation operations
    // ============================================

    /// Get a conversation by subject area and session id
    pub fn get_conversation(
        &self,
        subject_area: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationState>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM conversations WHERE subject_area = ? AND id = ?",
            [subject_area, conversation_id],
            Self::row_to_conversation,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Insert or replace a conversation record
    pub fn put_conversation(&self, subject_area: &str, state: &ConversationState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO conversations (subject_area, id, created_at, updated_at,
                                       last_intent_id, last_intent_name, duration_secs,
                                       duration_counted, browser, is_mobile,
                                       fallback_triggering_query)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(subject_area, id) DO UPDATE SET
                updated_at = excluded.updated_at,
                last_intent_id = excluded.last_intent_id,
                last_intent_name = excluded.last_intent_name,
                duration_secs = excluded.duration_secs,
                duration_counted = excluded.duration_counted,
                browser = excluded.browser,
                is_mobile = excluded.is_mobile,
                fallback_triggering_query = excluded.fallback_triggering_query
            "#,
            params![
                subject_area,
                state.id,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
                state.last_intent.id,
                state.last_intent.name,
                state.duration,
                state.duration_counted,
                state.browser,
                state.is_mobile,
                state.fallback_triggering_query,
            ],
        )?;
        Ok(())
    }

    fn row_to_conversation(row: &Row) -> rusqlite::Result<ConversationState> {
        Ok(ConversationState {
            id: row.get("id")?,
            created_at: timestamp_column(row, "created_at")?,
            updated_at: timestamp_column(row, "updated_at")?,
            last_intent: Intent {
                id: row.get("last_intent_id")?,
                name: row.get("last_intent_name")?,
            },
            duration: row.get("duration_secs")?,
            duration_counted: row.get("duration_counted")?,
            browser: row.get("browser")?,
            is_mobile: row.get("is_mobile")?,
            fallback_triggering_query: row.get("fallback_triggering_query")?,
        })
    }

    // ============================================
    // Bucket operations
    // ============================================

    /// Get the bucket for (subject area, day)
    pub fn get_bucket(&self, key: &BucketKey) -> Result<Option<DailyMetricBucket>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM metric_buckets WHERE subject_area = ? AND day = ?",
            [key.subject_area.as_str(), key.day.to_string().as_str()],
            Self::row_to_bucket,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Write a complete new bucket document.
    ///
    /// Fails if a bucket already exists for the key.
    pub fn create_bucket(&self, key: &BucketKey, bucket: &DailyMetricBucket) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO metric_buckets (subject_area, day, date, num_conversations,
                                        num_conversations_with_duration,
                                        average_conversation_duration, intents,
                                        daily_exit_intents, exit_intents, num_fallbacks,
                                        fallback_triggering_queries, user_browsers,
                                        mobile_conversations, non_mobile_conversations,
                                        feedback, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                key.subject_area,
                key.day.to_string(),
                key.day.iso(),
                bucket.num_conversations,
                bucket.num_conversations_with_duration,
                bucket.average_conversation_duration,
                serde_json::to_string(&bucket.intents)?,
                serde_json::to_string(&bucket.daily_exit_intents)?,
                serde_json::to_string(&bucket.exit_intents)?,
                bucket.num_fallbacks,
                serde_json::to_string(&bucket.fallback_triggering_queries)?,
                serde_json::to_string(&bucket.user_browsers)?,
                bucket.mobile_conversations,
                bucket.non_mobile_conversations,
                serde_json::to_string(&bucket.feedback)?,
                now,
                now,
            ],
        )?;
        Ok(())
    }

    /// Write only the fields set in `patch`; other fields are left untouched.
    pub fn update_bucket(&self, key: &BucketKey, patch: &BucketPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<&str> = vec![];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(v) = patch.num_conversations {
            sets.push("num_conversations = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = patch.num_conversations_with_duration {
            sets.push("num_conversations_with_duration = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = patch.average_conversation_duration {
            sets.push("average_conversation_duration = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = &patch.intents {
            sets.push("intents = ?");
            params.push(Box::new(serde_json::to_string(v)?));
        }
        if let Some(v) = &patch.daily_exit_intents {
            sets.push("daily_exit_intents = ?");
            params.push(Box::new(serde_json::to_string(v)?));
        }
        if let Some(v) = &patch.exit_intents {
            sets.push("exit_intents = ?");
            params.push(Box::new(serde_json::to_string(v)?));
        }
        if let Some(v) = patch.num_fallbacks {
            sets.push("num_fallbacks = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = &patch.fallback_triggering_queries {
            sets.push("fallback_triggering_queries = ?");
            params.push(Box::new(serde_json::to_string(v)?));
        }
        if let Some(v) = &patch.user_browsers {
            sets.push("user_browsers = ?");
            params.push(Box::new(serde_json::to_string(v)?));
        }
        if let Some(v) = patch.mobile_conversations {
            sets.push("mobile_conversations = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = patch.non_mobile_conversations {
            sets.push("non_mobile_conversations = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = &patch.feedback {
            sets.push("feedback = ?");
            params.push(Box::new(serde_json::to_string(v)?));
        }

        sets.push("updated_at = ?");
        params.push(Box::new(Utc::now().to_rfc3339()));

        let sql = format!(
            "UPDATE metric_buckets SET {} WHERE subject_area = ? AND day = ?",
            sets.join(", ")
        );
        params.push(Box::new(key.subject_area.clone()));
        params.push(Box::new(key.day.to_string()));

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn()?;
        let updated = conn.execute(&sql, params_refs.as_slice())?;
        if updated == 0 {
            return Err(Error::InconsistentBucket {
                subject_area: key.subject_area.clone(),
                day: key.day.to_string(),
                message: "bucket does not exist".to_string(),
            });
        }
        Ok(())
    }

    /// Buckets of one subject area whose day falls in `range`, ordered by date
    pub fn list_buckets(
        &self,
        subject_area: &str,
        range: &DateRange,
    ) -> Result<Vec<DailyMetricBucket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM metric_buckets
            WHERE subject_area = ?1 AND date >= ?2 AND date <= ?3
            ORDER BY date
            "#,
        )?;
        let start = DayKey::from_date(range.start).iso();
        let end = DayKey::from_date(range.end).iso();
        let buckets = stmt
            .query_map(params![subject_area, start, end], Self::row_to_bucket)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    fn row_to_bucket(row: &Row) -> rusqlite::Result<DailyMetricBucket> {
        let day_str: String = row.get("day")?;
        let date = DayKey::parse(&day_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                Type::Text,
                format!("invalid day key: {}", day_str).into(),
            )
        })?;

        Ok(DailyMetricBucket {
            date,
            num_conversations: row.get("num_conversations")?,
            num_conversations_with_duration: row.get("num_conversations_with_duration")?,
            average_conversation_duration: row.get("average_conversation_duration")?,
            intents: json_column(row, "intents")?,
            daily_exit_intents: json_column(row, "daily_exit_intents")?,
            exit_intents: json_column(row, "exit_intents")?,
            num_fallbacks: row.get("num_fallbacks")?,
            fallback_triggering_queries: json_column(row, "fallback_triggering_queries")?,
            user_browsers: json_column(row, "user_browsers")?,
            mobile_conversations: row.get("mobile_conversations")?,
            non_mobile_conversations: row.get("non_mobile_conversations")?,
            feedback: json_column(row, "feedback")?,
        })
    }

    // ============================================
    // Request log operations
    // ============================================

    /// Whether a turn with this event id was already recorded
    pub fn has_request(&self, subject_area: &str, event_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM conversation_requests WHERE subject_area = ? AND event_id = ?",
                [subject_area, event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Append a turn to the request log.
    ///
    /// Returns false when a record with the same event id already exists.
    pub fn record_request(&self, subject_area: &str, record: &RequestRecord) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO conversation_requests
                (subject_area, conversation_id, event_id, received_at, language,
                 intent_id, intent_name, confidence, message_text)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                subject_area,
                record.conversation_id,
                record.event_id,
                record.received_at.to_rfc3339(),
                record.language,
                record.intent.id,
                record.intent.name,
                record.confidence,
                record.message_text,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Logged turns of one conversation in arrival order
    pub fn list_requests(
        &self,
        subject_area: &str,
        conversation_id: &str,
    ) -> Result<Vec<RequestRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM conversation_requests
            WHERE subject_area = ? AND conversation_id = ?
            ORDER BY id
            "#,
        )?;
        let records = stmt
            .query_map([subject_area, conversation_id], Self::row_to_request)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn row_to_request(row: &Row) -> rusqlite::Result<RequestRecord> {
        Ok(RequestRecord {
            conversation_id: row.get("conversation_id")?,
            event_id: row.get("event_id")?,
            received_at: timestamp_column(row, "received_at")?,
            language: row.get("language")?,
            intent: Intent {
                id: row.get("intent_id")?,
                name: row.get("intent_name")?,
            },
            confidence: row.get("confidence")?,
            message_text: row.get("message_text")?,
        })
    }
}

/// Decode a JSON text column, surfacing bad documents as conversion errors
fn json_column<T: DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| {
        let idx = row.as_ref().column_index(column).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn timestamp_column(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            let idx = row.as_ref().column_index(column).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}
