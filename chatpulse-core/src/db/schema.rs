//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: settings, conversation state, daily buckets
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        subject_area           TEXT PRIMARY KEY,
        timezone_name          TEXT NOT NULL,
        timezone_offset_hours  REAL NOT NULL,
        primary_color          TEXT NOT NULL,
        created_at             DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS conversations (
        subject_area              TEXT NOT NULL,
        id                        TEXT NOT NULL,
        created_at                DATETIME NOT NULL,
        updated_at                DATETIME NOT NULL,
        last_intent_id            TEXT NOT NULL,
        last_intent_name          TEXT NOT NULL,
        duration_secs             INTEGER NOT NULL DEFAULT 0,
        duration_counted          INTEGER NOT NULL DEFAULT 0,
        browser                   TEXT NOT NULL DEFAULT '',
        is_mobile                 INTEGER NOT NULL DEFAULT 0,
        fallback_triggering_query TEXT NOT NULL DEFAULT '',

        PRIMARY KEY (subject_area, id)
    );

    -- One document per (subject area, day). `day` is the MM-DD-YYYY key,
    -- `date` the same day in sortable form for range scans.
    CREATE TABLE IF NOT EXISTS metric_buckets (
        subject_area                    TEXT NOT NULL,
        day                             TEXT NOT NULL,
        date                            TEXT NOT NULL,
        num_conversations               INTEGER NOT NULL DEFAULT 0,
        num_conversations_with_duration INTEGER NOT NULL DEFAULT 0,
        average_conversation_duration   REAL NOT NULL DEFAULT 0,
        intents                         JSON NOT NULL DEFAULT '[]',
        daily_exit_intents              JSON NOT NULL DEFAULT '{}',
        exit_intents                    JSON NOT NULL DEFAULT '[]',
        num_fallbacks                   INTEGER NOT NULL DEFAULT 0,
        fallback_triggering_queries     JSON NOT NULL DEFAULT '[]',
        user_browsers                   JSON NOT NULL DEFAULT '{}',
        mobile_conversations            INTEGER NOT NULL DEFAULT 0,
        non_mobile_conversations        INTEGER NOT NULL DEFAULT 0,
        created_at                      DATETIME NOT NULL,
        updated_at                      DATETIME NOT NULL,

        PRIMARY KEY (subject_area, day)
    );

    CREATE INDEX IF NOT EXISTS idx_metric_buckets_date ON metric_buckets(subject_area, date);
    "#,
    // Version 2: feedback tallies and the per-turn request log
    r#"
    ALTER TABLE metric_buckets
        ADD COLUMN feedback JSON NOT NULL
        DEFAULT '{"positive":0,"negative":0,"helpful":[],"not_helpful":[]}';

    CREATE TABLE IF NOT EXISTS conversation_requests (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        subject_area     TEXT NOT NULL,
        conversation_id  TEXT NOT NULL,
        event_id         TEXT,
        received_at      DATETIME NOT NULL,
        language         TEXT,
        intent_id        TEXT NOT NULL,
        intent_name      TEXT NOT NULL,
        confidence       REAL,
        message_text     TEXT NOT NULL DEFAULT '',

        UNIQUE(subject_area, event_id)
    );

    CREATE INDEX IF NOT EXISTS idx_requests_conversation
        ON conversation_requests(subject_area, conversation_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
