//! SQLite schema and versioned migrations for the metadata cache.

use rusqlite::Connection;

pub const DDL_SCHEMA_VERSION: &str = "\
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);";

/// One row per sample: the opaque record blob plus the indexed columns the
/// validator and queue reconstruction query against.
pub const DDL_SAMPLES: &str = "\
CREATE TABLE IF NOT EXISTS samples (
    id INTEGER PRIMARY KEY,
    record TEXT NOT NULL,
    last_updated TEXT,
    last_existence_check TEXT,
    priority_score REAL,
    is_dormant INTEGER NOT NULL DEFAULT 0,
    dormant_since TEXT
);";

pub const DDL_INDEX_EXISTENCE: &str = "\
CREATE INDEX IF NOT EXISTS idx_samples_existence ON samples(last_existence_check);";

pub const DDL_INDEX_PRIORITY: &str = "\
CREATE INDEX IF NOT EXISTS idx_samples_priority ON samples(priority_score);";

/// All DDL statements for schema version 1, in order.
pub const SCHEMA_V1: &[&str] = &[
    DDL_SCHEMA_VERSION,
    DDL_SAMPLES,
    DDL_INDEX_EXISTENCE,
    DDL_INDEX_PRIORITY,
];

pub const CURRENT_VERSION: i32 = 1;

/// Apply schema migrations up to [`CURRENT_VERSION`]. Idempotent; returns
/// the version in effect afterwards.
pub fn apply_migrations(conn: &Connection) -> Result<i32, rusqlite::Error> {
    conn.execute_batch(DDL_SCHEMA_VERSION)?;

    let current = current_version(conn)?;
    if current >= CURRENT_VERSION {
        return Ok(current);
    }

    if current < 1 {
        for ddl in SCHEMA_V1 {
            conn.execute_batch(ddl)?;
        }
        record_version(conn, 1)?;
    }

    // Future migrations go here:
    // if current < 2 { ... record_version(conn, 2)?; }

    Ok(CURRENT_VERSION)
}

fn current_version(conn: &Connection) -> Result<i32, rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

fn record_version(conn: &Connection, version: i32) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
