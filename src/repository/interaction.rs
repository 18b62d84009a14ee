//! Append-only interaction log.
//!
//! Every significant transition (batch status, rotation, category, export
//! outcome) is recorded here. Minimal deployments may lack the table; in
//! that case writes degrade to a debug log line instead of failing the
//! operation that triggered them.

use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{connect, init_schema, Result};

/// Well-known event types. Compared by identity, never parsed.
pub mod events {
    pub const BATCH_STATUS: &str = "batch_status_changed";
    pub const ROTATION_SET: &str = "rotation_set";
    pub const CATEGORY_CHANGED: &str = "category_changed";
    pub const EXPORT_SUCCEEDED: &str = "export_succeeded";
    pub const EXPORT_FAILED: &str = "export_failed";
    pub const RESCAN_REQUESTED: &str = "rescan_requested";
    pub const TAGS_EXTRACTED: &str = "tags_extracted";
}

#[derive(Clone)]
pub struct InteractionLog {
    db_path: PathBuf,
}

impl InteractionLog {
    pub fn new(db_path: &Path) -> Result<Self> {
        let log = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = connect(&log.db_path)?;
        init_schema(&conn)?;
        Ok(log)
    }

    /// Open against an existing database without touching the schema.
    /// Used by deployments where the log table may be absent.
    pub fn open_existing(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    /// Append one event. Never fails the caller: a missing table or a
    /// locked database is reported at debug level and swallowed.
    pub fn append(
        &self,
        event_type: &str,
        batch_id: Option<i64>,
        document_id: Option<i64>,
        detail: &str,
    ) {
        let result = connect(&self.db_path).and_then(|conn| {
            conn.execute(
                "INSERT INTO interaction_log \
                     (occurred_at, event_type, batch_id, document_id, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    Utc::now().to_rfc3339(),
                    event_type,
                    batch_id,
                    document_id,
                    detail
                ],
            )
            .map_err(Into::into)
        });

        if let Err(e) = result {
            tracing::debug!("interaction log write skipped: {}", e);
        }
    }

    /// Recent events, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<(String, String, String)>> {
        let conn = connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT occurred_at, event_type, COALESCE(detail, '') \
             FROM interaction_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let log = InteractionLog::new(&dir.path().join("test.db")).unwrap();
        log.append(events::BATCH_STATUS, Some(1), None, "pending_verification");
        log.append(events::ROTATION_SET, None, Some(2), "page 3 -> 90");

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1, events::ROTATION_SET);
    }

    #[test]
    fn test_append_degrades_without_table() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("bare.db");
        // A database that never ran the schema
        rusqlite::Connection::open(&db).unwrap();
        let log = InteractionLog::open_existing(&db);
        // Must not panic or error the caller
        log.append(events::EXPORT_FAILED, Some(9), None, "disk full");
    }
}
