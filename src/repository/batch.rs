//! Batch persistence and the Batch Guard.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, Row, TransactionBehavior};

use crate::models::{Batch, BatchKind, BatchStatus};

use super::{connect, init_schema, read_timestamp, optional_row, retry_on_busy, RepositoryError, Result};

/// Named critical sections, one per batch kind.
///
/// Creation of a processing batch must be serialized so that concurrent
/// smart-processing requests agree on a single batch id. The mutex guards
/// the check-then-create window; the IMMEDIATE transaction inside guards
/// against other processes on the same database file.
struct BatchGuards {
    single: Mutex<()>,
    grouped: Mutex<()>,
}

impl BatchGuards {
    fn lock(&self, kind: BatchKind) -> MutexGuard<'_, ()> {
        let section = match kind {
            BatchKind::SingleDocumentBatch => &self.single,
            BatchKind::GroupedBatch => &self.grouped,
        };
        section.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// SQLite-backed batch repository. Clones share the guard sections.
#[derive(Clone)]
pub struct BatchRepository {
    db_path: PathBuf,
    guards: Arc<BatchGuards>,
}

const REUSABLE_STATUSES: &str =
    "'pending_processing','pending_verification','pending_grouping','pending_ordering'";

impl BatchRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
            guards: Arc::new(BatchGuards {
                single: Mutex::new(()),
                grouped: Mutex::new(()),
            }),
        };
        let conn = repo.connect()?;
        init_schema(&conn)?;
        Ok(repo)
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    /// Return the reusable processing batch for `kind`, creating it if none
    /// exists. Under concurrent callers exactly one batch is created; the
    /// rest observe the winner's id.
    pub fn get_or_create_processing_batch(&self, kind: BatchKind) -> Result<Batch> {
        let _section = self.guards.lock(kind);

        retry_on_busy(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Re-check inside the critical section: another caller may have
            // won the race before we acquired the lock.
            let existing = optional_row(tx.query_row(
                &format!(
                    "SELECT id, kind, status, created_at, updated_at FROM batches \
                     WHERE kind = ?1 AND status IN ({REUSABLE_STATUSES}) \
                       AND NOT EXISTS (SELECT 1 FROM single_documents sd \
                                       WHERE sd.batch_id = batches.id AND sd.state = 'exported') \
                       AND NOT EXISTS (SELECT 1 FROM grouped_documents gd \
                                       WHERE gd.batch_id = batches.id AND gd.state = 'exported') \
                     ORDER BY id LIMIT 1"
                ),
                params![kind.as_str()],
                map_batch_row,
            ))?;

            if let Some(batch) = existing {
                tx.commit()?;
                return Ok(batch);
            }

            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO batches (kind, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![kind.as_str(), BatchStatus::PendingProcessing.as_str(), now],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            tracing::info!("Created {} batch {}", kind.as_str(), id);
            Ok(Batch {
                id,
                kind,
                status: BatchStatus::PendingProcessing,
                created_at: read_timestamp(&now),
                updated_at: read_timestamp(&now),
            })
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Batch>> {
        let conn = self.connect()?;
        optional_row(conn.query_row(
            "SELECT id, kind, status, created_at, updated_at FROM batches WHERE id = ?1",
            params![id],
            map_batch_row,
        ))
    }

    pub fn list(&self) -> Result<Vec<Batch>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, status, created_at, updated_at FROM batches ORDER BY id DESC",
        )?;
        let batches = stmt
            .query_map([], map_batch_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    /// Atomically move a batch along the status lattice.
    ///
    /// Forward moves and `failed` are always allowed; the only backward move
    /// is the explicit admin reset to `pending_processing`.
    pub fn transition(&self, id: i64, next: BatchStatus) -> Result<Batch> {
        retry_on_busy(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = optional_row(tx.query_row(
                "SELECT id, kind, status, created_at, updated_at FROM batches WHERE id = ?1",
                params![id],
                map_batch_row,
            ))?
            .ok_or_else(|| RepositoryError::NotFound(format!("batch {}", id)))?;

            let allowed = current.status.can_transition_to(next)
                || BatchStatus::is_admin_reset(next)
                || current.status == next;
            if !allowed {
                return Err(RepositoryError::InvalidTransition(format!(
                    "batch {}: {} -> {}",
                    id,
                    current.status.as_str(),
                    next.as_str()
                )));
            }

            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE batches SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), now, id],
            )?;
            tx.commit()?;

            Ok(Batch {
                status: next,
                updated_at: read_timestamp(&now),
                ..current
            })
        })
    }

    /// Startup sweep: remove processing batches with zero documents,
    /// left behind by a crash or restart.
    pub fn delete_empty_processing_batches(&self) -> Result<usize> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM batches \
                 WHERE status IN ({REUSABLE_STATUSES}) \
                   AND NOT EXISTS (SELECT 1 FROM single_documents sd WHERE sd.batch_id = batches.id) \
                   AND NOT EXISTS (SELECT 1 FROM grouped_documents gd WHERE gd.batch_id = batches.id)"
            ),
            [],
        )?;
        if deleted > 0 {
            tracing::info!("Startup sweep removed {} empty batches", deleted);
        }
        Ok(deleted)
    }
}

fn map_batch_row(row: &Row) -> rusqlite::Result<Batch> {
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Batch {
        id: row.get(0)?,
        kind: BatchKind::from_str(&kind).unwrap_or(BatchKind::SingleDocumentBatch),
        status: BatchStatus::from_str(&status).unwrap_or(BatchStatus::Failed),
        created_at: read_timestamp(&created_at),
        updated_at: read_timestamp(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn repo() -> (BatchRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = BatchRepository::new(&dir.path().join("test.db")).unwrap();
        (repo, dir)
    }

    #[test]
    fn test_get_or_create_reuses_processing_batch() {
        let (repo, _dir) = repo();
        let a = repo
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        let b = repo
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_kinds_get_separate_batches() {
        let (repo, _dir) = repo();
        let single = repo
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        let grouped = repo
            .get_or_create_processing_batch(BatchKind::GroupedBatch)
            .unwrap();
        assert_ne!(single.id, grouped.id);
    }

    #[test]
    fn test_exported_batch_is_not_reused() {
        let (repo, _dir) = repo();
        let a = repo
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        repo.transition(a.id, BatchStatus::PendingVerification).unwrap();
        repo.transition(a.id, BatchStatus::PendingExport).unwrap();
        let b = repo
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_backward_transition_rejected() {
        let (repo, _dir) = repo();
        let batch = repo
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        repo.transition(batch.id, BatchStatus::PendingExport).unwrap();
        let err = repo.transition(batch.id, BatchStatus::PendingVerification);
        assert!(matches!(err, Err(RepositoryError::InvalidTransition(_))));
        // Admin reset is the sanctioned way back
        let reset = repo
            .transition(batch.id, BatchStatus::PendingProcessing)
            .unwrap();
        assert_eq!(reset.status, BatchStatus::PendingProcessing);
    }

    #[test]
    fn test_startup_sweep_removes_empty_batches() {
        let (repo, _dir) = repo();
        let batch = repo
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        assert_eq!(repo.delete_empty_processing_batches().unwrap(), 1);
        assert!(repo.get(batch.id).unwrap().is_none());
    }
}
