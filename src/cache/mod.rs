//! Embedded metadata cache over SQLite.
//!
//! One table maps sample ID to an opaque JSON record plus the indexed
//! columns used for validator target selection and queue reconstruction.
//! Writes go through a write-behind buffer flushed on size, age, `close()`,
//! and every checkpoint save. WAL journaling with NORMAL synchronous trades
//! an in-flight buffer on crash for throughput; the next crawl re-fetches
//! anything lost.

pub mod schema;

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use crate::api::SampleRecord;
use crate::error::EchomapError;
use crate::SampleId;

/// Write-behind buffer flushes when it reaches this many records...
pub const WRITE_BUFFER_CAP: usize = 200;
/// ...or when the oldest buffered record is this old.
pub const WRITE_BUFFER_MAX_AGE: Duration = Duration::from_secs(30);

/// Bound parameters per inserted row:
/// (id, record, last_updated, last_existence_check, priority_score, is_dormant).
pub const PARAMS_PER_ROW: usize = 6;

/// SQLite rejects prepared statements with more than 999 parameters, so a
/// multi-row insert is capped at 166 rows (166 × 6 = 996).
pub const SAFE_CHUNK: usize = 166;

/// Hard cap on rows per bulk-insert transaction; larger maps are split.
pub const MAX_BATCH_ROWS: usize = 500;

#[derive(Debug)]
pub struct MetadataCache {
    conn: Connection,
    buffer: Vec<SampleRecord>,
    buffer_since: Option<Instant>,
    /// Multi-row INSERT statements executed so far (diagnostics).
    bulk_statements: u64,
}

impl MetadataCache {
    pub fn open(path: &Path) -> Result<Self, EchomapError> {
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self, EchomapError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, EchomapError> {
        // journal_mode returns a result row; plain pragma_update rejects it.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        // NORMAL, not FULL: losing an in-flight buffer on power loss is
        // recoverable by re-fetching.
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        schema::apply_migrations(&conn)?;

        Ok(Self {
            conn,
            buffer: Vec::with_capacity(WRITE_BUFFER_CAP),
            buffer_since: None,
            bulk_statements: 0,
        })
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Buffered upsert. Later `set` calls for the same ID supersede earlier
    /// ones still in the buffer.
    pub fn set(&mut self, record: SampleRecord) -> Result<(), EchomapError> {
        self.buffer.retain(|r| r.id != record.id);
        self.buffer.push(record);
        self.buffer_since.get_or_insert_with(Instant::now);

        let aged = self
            .buffer_since
            .is_some_and(|since| since.elapsed() >= WRITE_BUFFER_MAX_AGE);
        if self.buffer.len() >= WRITE_BUFFER_CAP || aged {
            self.flush()?;
        }
        Ok(())
    }

    /// Drain the write-behind buffer to disk.
    pub fn flush(&mut self) -> Result<(), EchomapError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        self.buffer_since = None;
        self.insert_rows(&rows, SAFE_CHUNK)
    }

    /// Bulk upsert for large imports, chunked at the safe ceiling.
    pub fn bulk_insert(&mut self, rows: &[SampleRecord]) -> Result<(), EchomapError> {
        self.bulk_insert_chunked(rows, SAFE_CHUNK)
    }

    /// Bulk upsert with a caller-requested chunk size. Requests above the
    /// safe ceiling are capped with a warning rather than rejected.
    pub fn bulk_insert_chunked(
        &mut self,
        rows: &[SampleRecord],
        chunk_size: usize,
    ) -> Result<(), EchomapError> {
        let chunk_size = if chunk_size > SAFE_CHUNK {
            tracing::warn!(
                requested = chunk_size,
                cap = SAFE_CHUNK,
                "bulk insert chunk size exceeds the parameter-limit ceiling — capping"
            );
            SAFE_CHUNK
        } else {
            chunk_size.max(1)
        };
        self.insert_rows(rows, chunk_size)
    }

    fn insert_rows(&mut self, rows: &[SampleRecord], chunk_size: usize) -> Result<(), EchomapError> {
        if rows.is_empty() {
            return Ok(());
        }
        for batch in rows.chunks(MAX_BATCH_ROWS) {
            let tx = self.conn.transaction()?;
            for chunk in batch.chunks(chunk_size) {
                let placeholders = vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
                let sql = format!(
                    "INSERT OR REPLACE INTO samples \
                     (id, record, last_updated, last_existence_check, priority_score, is_dormant) \
                     VALUES {placeholders}"
                );

                let mut params: Vec<SqlValue> =
                    Vec::with_capacity(chunk.len() * PARAMS_PER_ROW);
                for record in chunk {
                    let blob = serde_json::to_string(record)?;
                    params.push(SqlValue::Integer(record.id));
                    params.push(SqlValue::Text(blob));
                    params.push(SqlValue::Text(Utc::now().to_rfc3339()));
                    params.push(opt_ts(record.last_existence_check_at));
                    params.push(SqlValue::Real(record.priority_score));
                    params.push(SqlValue::Integer(0));
                }

                tx.execute(&sql, rusqlite::params_from_iter(params))?;
                self.bulk_statements += 1;
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Merge `partial` into the stored JSON record and sync the indexed
    /// columns in the same statement. Returns false if the ID is unknown.
    pub fn update_fields(
        &mut self,
        id: SampleId,
        partial: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, EchomapError> {
        self.flush()?;

        let blob: Option<String> = self
            .conn
            .query_row("SELECT record FROM samples WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(ignore_no_rows)?;
        let Some(blob) = blob else {
            return Ok(false);
        };

        let mut value: serde_json::Value = serde_json::from_str(&blob)?;
        let Some(object) = value.as_object_mut() else {
            return Err(EchomapError::Other(format!(
                "record for sample {id} is not a JSON object"
            )));
        };
        for (key, field) in partial {
            object.insert(key.clone(), field.clone());
        }

        let priority: Option<f64> = partial.get("priority_score").and_then(|v| v.as_f64());
        let existence: Option<String> = partial
            .get("last_existence_check_at")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.conn.execute(
            "UPDATE samples SET record = ?2, last_updated = ?3, \
             last_existence_check = COALESCE(?4, last_existence_check), \
             priority_score = COALESCE(?5, priority_score) \
             WHERE id = ?1",
            rusqlite::params![
                id,
                serde_json::to_string(&value)?,
                Utc::now().to_rfc3339(),
                existence,
                priority,
            ],
        )?;
        Ok(true)
    }

    /// Stamp a successful existence check without touching metadata fields.
    pub fn record_existence_check(
        &mut self,
        id: SampleId,
        now: DateTime<Utc>,
    ) -> Result<bool, EchomapError> {
        let mut partial = serde_json::Map::new();
        partial.insert(
            "last_existence_check_at".into(),
            serde_json::Value::String(now.to_rfc3339()),
        );
        self.update_fields(id, &partial)
    }

    pub fn delete(&mut self, id: SampleId) -> Result<bool, EchomapError> {
        self.buffer.retain(|r| r.id != id);
        let changed = self
            .conn
            .execute("DELETE FROM samples WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    /// Mark a sample dormant: it stops being selected for partial
    /// validation until a successful validation wakes it.
    pub fn mark_dormant(&mut self, id: SampleId, now: DateTime<Utc>) -> Result<(), EchomapError> {
        self.conn.execute(
            "UPDATE samples SET is_dormant = 1, \
             dormant_since = COALESCE(dormant_since, ?2) WHERE id = ?1",
            rusqlite::params![id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn wake(&mut self, id: SampleId) -> Result<(), EchomapError> {
        self.conn.execute(
            "UPDATE samples SET is_dormant = 0, dormant_since = NULL WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    pub fn get(&self, id: SampleId) -> Result<Option<SampleRecord>, EchomapError> {
        // The buffer is newer than disk; program order must hold for readers
        // in the same process.
        if let Some(buffered) = self.buffer.iter().rev().find(|r| r.id == id) {
            return Ok(Some(buffered.clone()));
        }

        let blob: Option<String> = self
            .conn
            .query_row("SELECT record FROM samples WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(ignore_no_rows)?;
        blob.map(|b| serde_json::from_str(&b).map_err(EchomapError::from))
            .transpose()
    }

    pub fn contains(&self, id: SampleId) -> Result<bool, EchomapError> {
        if self.buffer.iter().any(|r| r.id == id) {
            return Ok(true);
        }
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM samples WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(ignore_no_rows)?;
        Ok(found.is_some())
    }

    /// All known IDs, ascending. Flushes first so the answer is complete.
    pub fn ids(&mut self) -> Result<Vec<SampleId>, EchomapError> {
        self.flush()?;
        let mut stmt = self.conn.prepare("SELECT id FROM samples ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<SampleId>, _>>()?;
        Ok(ids)
    }

    /// Up to `n` non-dormant IDs, oldest existence check first. Rows never
    /// checked (NULL) sort before everything else.
    pub fn select_oldest_by_existence_check(
        &mut self,
        n: usize,
    ) -> Result<Vec<SampleId>, EchomapError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "SELECT id FROM samples WHERE is_dormant = 0 \
             ORDER BY last_existence_check ASC, id ASC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map([n as i64], |row| row.get(0))?
            .collect::<Result<Vec<SampleId>, _>>()?;
        Ok(ids)
    }

    pub fn row_count(&mut self) -> Result<usize, EchomapError> {
        self.flush()?;
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Number of stored records with a non-positive filesize: the cheap
    /// corruption probe run by the checkpoint verifier.
    pub fn corrupt_filesize_count(&mut self) -> Result<usize, EchomapError> {
        self.flush()?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM samples \
             WHERE COALESCE(CAST(json_extract(record, '$.filesize') AS INTEGER), 0) <= 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Visit every stored record. Used to rebuild the crawler's membership
    /// index at load time.
    pub fn for_each_record<F>(&mut self, mut visit: F) -> Result<(), EchomapError>
    where
        F: FnMut(SampleId, SampleRecord),
    {
        self.flush()?;
        let mut stmt = self.conn.prepare("SELECT id, record FROM samples")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, SampleId>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, blob) = row?;
            match serde_json::from_str(&blob) {
                Ok(record) => visit(id, record),
                Err(e) => tracing::warn!(id, "skipping undecodable cache record: {e}"),
            }
        }
        Ok(())
    }

    pub fn dormant_ids(&mut self) -> Result<HashSet<SampleId>, EchomapError> {
        self.flush()?;
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM samples WHERE is_dormant = 1")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<SampleId>, _>>()?;
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Fold the WAL back into the main database file so the on-disk file is
    /// self-contained for checkpointing and archiving.
    pub fn checkpoint_wal(&mut self) -> Result<(), EchomapError> {
        self.flush()?;
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), EchomapError> {
        self.checkpoint_wal()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn bulk_statements_executed(&self) -> u64 {
        self.bulk_statements
    }
}

fn opt_ts(ts: Option<DateTime<Utc>>) -> SqlValue {
    match ts {
        Some(t) => SqlValue::Text(t.to_rfc3339()),
        None => SqlValue::Null,
    }
}

fn ignore_no_rows<T>(e: rusqlite::Error) -> Result<Option<T>, rusqlite::Error> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}
