//! Repository layer for database persistence.

mod batch;
mod document;
mod grouped;
pub mod interaction;
mod rotation;

pub use batch::BatchRepository;
pub use document::DocumentRepository;
pub use interaction::InteractionLog;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Timestamps are stored as RFC 3339 text. A row that predates the format
/// (or was edited by hand) reads as the epoch rather than failing the query.
pub fn read_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn read_timestamp_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw?.parse().ok()
}

/// Lift "no rows" out of the error channel; every other failure stays one.
pub fn optional_row<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        other => Ok(Some(other?)),
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Open the store. Repositories hold a path, not a connection: every
/// operation opens its own short-lived handle, so workers never contend
/// over a shared one. WAL keeps readers unblocked while a writer commits.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(30))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Create all tables. Idempotent; every repository runs it on construction.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS single_documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
            source_hash TEXT NOT NULL,
            source_path TEXT NOT NULL,
            page_count INTEGER NOT NULL DEFAULT 0,
            ocr_text TEXT,
            ocr_confidence REAL,
            sig_file_size INTEGER,
            sig_mtime INTEGER,
            sig_sha1_prefix TEXT,
            rotation INTEGER,
            searchable_pdf_path TEXT,
            ai_category TEXT,
            ai_filename TEXT,
            ai_summary TEXT,
            ai_confidence REAL,
            final_category TEXT,
            final_filename TEXT,
            state TEXT NOT NULL DEFAULT 'new',
            error TEXT,
            llm_rescanned_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(batch_id, source_hash)
        );
        CREATE INDEX IF NOT EXISTS idx_single_documents_batch
            ON single_documents(batch_id);

        CREATE TABLE IF NOT EXISTS grouped_documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            final_category TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'new',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_grouped_documents_batch
            ON grouped_documents(batch_id);

        CREATE TABLE IF NOT EXISTS grouped_pages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL REFERENCES grouped_documents(id) ON DELETE CASCADE,
            artifact_hash TEXT NOT NULL,
            page_index INTEGER NOT NULL,
            category TEXT,
            rotation INTEGER,
            ocr_text TEXT,
            position INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_grouped_pages_document
            ON grouped_pages(document_id);

        CREATE TABLE IF NOT EXISTS intake_pages (
            artifact_hash TEXT NOT NULL,
            page_index INTEGER NOT NULL,
            ocr_text TEXT,
            ocr_confidence REAL,
            PRIMARY KEY (artifact_hash, page_index)
        );

        CREATE TABLE IF NOT EXISTS intake_rotations (
            artifact_hash TEXT NOT NULL,
            page_index INTEGER NOT NULL,
            angle INTEGER NOT NULL,
            PRIMARY KEY (artifact_hash, page_index)
        );

        CREATE TABLE IF NOT EXISTS interaction_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            occurred_at TEXT NOT NULL,
            event_type TEXT NOT NULL,
            batch_id INTEGER,
            document_id INTEGER,
            detail TEXT
        );
    "#,
    )?;
    Ok(())
}

/// Attempts a write makes before a busy database becomes its caller's error.
const BUSY_ATTEMPTS: u32 = 5;

/// Run a store operation, backing off and retrying while SQLite reports
/// contention. Anything that is not SQLITE_BUSY/SQLITE_LOCKED surfaces
/// unchanged on the first attempt.
pub fn retry_on_busy<T, F>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut backoff = Duration::from_millis(100);
    for attempt in 1.. {
        let error = match operation() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if attempt >= BUSY_ATTEMPTS || !is_busy(&error) {
            return Err(error);
        }
        tracing::debug!(
            "store busy on attempt {}, backing off {:?}",
            attempt,
            backoff
        );
        thread::sleep(backoff);
        backoff *= 2;
    }
    unreachable!("retry loop always returns")
}

fn is_busy(error: &RepositoryError) -> bool {
    let RepositoryError::Database(rusqlite::Error::SqliteFailure(inner, _)) = error else {
        return false;
    };
    matches!(
        inner.code,
        rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy_error() -> RepositoryError {
        RepositoryError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn test_optional_row_lifts_no_rows() {
        let missing: Result<Option<i64>> =
            optional_row(Err(rusqlite::Error::QueryReturnedNoRows));
        assert!(matches!(missing, Ok(None)));
        let present: Result<Option<i64>> = optional_row(Ok(7));
        assert!(matches!(present, Ok(Some(7))));
    }

    #[test]
    fn test_read_timestamp_defaults_to_epoch() {
        assert_eq!(read_timestamp("garbage"), DateTime::UNIX_EPOCH);
        let now = Utc::now();
        assert_eq!(read_timestamp(&now.to_rfc3339()), now);
        assert_eq!(read_timestamp_opt(None), None);
    }

    #[test]
    fn test_retry_on_busy_retries_contention_only() {
        let mut busy_attempts = 0;
        let result: Result<&str> = retry_on_busy(|| {
            busy_attempts += 1;
            if busy_attempts < 3 {
                Err(busy_error())
            } else {
                Ok("done")
            }
        });
        assert!(matches!(result, Ok("done")));
        assert_eq!(busy_attempts, 3);

        // Non-contention errors surface on the first attempt
        let mut other_attempts = 0;
        let result: Result<()> = retry_on_busy(|| {
            other_attempts += 1;
            Err(RepositoryError::NotFound("batch 9".into()))
        });
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
        assert_eq!(other_attempts, 1);
    }
}
