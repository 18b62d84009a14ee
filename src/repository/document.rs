//! Single-document persistence: OCR output, AI fields, signatures.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::models::{DocumentState, OcrSignature, SingleDocument};

use super::{
    connect, init_schema, read_timestamp, read_timestamp_opt, optional_row, retry_on_busy,
    RepositoryError, Result,
};

/// SQLite-backed document repository.
///
/// Covers single documents here; grouped documents, intake pages, and
/// rotation overrides live in sibling modules as further impl blocks.
#[derive(Clone)]
pub struct DocumentRepository {
    pub(crate) db_path: PathBuf,
}

const SINGLE_COLUMNS: &str = "id, batch_id, source_hash, source_path, page_count, \
     ocr_text, ocr_confidence, sig_file_size, sig_mtime, sig_sha1_prefix, rotation, \
     searchable_pdf_path, ai_category, ai_filename, ai_summary, ai_confidence, \
     final_category, final_filename, state, error, llm_rescanned_at, created_at, updated_at";

impl DocumentRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = repo.connect()?;
        init_schema(&conn)?;
        Ok(repo)
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    /// Insert a document for `(batch_id, source_hash)`, or return the existing
    /// row. The uniqueness constraint is what lets a second smart-processing
    /// run attach to work already in flight.
    pub fn insert_or_get(
        &self,
        batch_id: i64,
        source_hash: &str,
        source_path: &Path,
        page_count: u32,
    ) -> Result<SingleDocument> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO single_documents \
                     (batch_id, source_hash, source_path, page_count, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
                 ON CONFLICT(batch_id, source_hash) DO NOTHING",
                params![
                    batch_id,
                    source_hash,
                    source_path.to_string_lossy().into_owned(),
                    page_count,
                    now
                ],
            )?;
            let doc = optional_row(conn.query_row(
                &format!(
                    "SELECT {SINGLE_COLUMNS} FROM single_documents \
                     WHERE batch_id = ?1 AND source_hash = ?2"
                ),
                params![batch_id, source_hash],
                map_single_row,
            ))?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("document {}/{}", batch_id, source_hash))
            })?;
            Ok(doc)
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<SingleDocument>> {
        let conn = self.connect()?;
        optional_row(conn.query_row(
            &format!("SELECT {SINGLE_COLUMNS} FROM single_documents WHERE id = ?1"),
            params![id],
            map_single_row,
        ))
    }

    pub fn list_by_batch(&self, batch_id: i64) -> Result<Vec<SingleDocument>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SINGLE_COLUMNS} FROM single_documents WHERE batch_id = ?1 ORDER BY id"
        ))?;
        let docs = stmt
            .query_map(params![batch_id], map_single_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    /// Persist OCR output and the signature that gates its reuse.
    #[allow(clippy::too_many_arguments)]
    pub fn store_ocr_result(
        &self,
        id: i64,
        text: &str,
        confidence: Option<f64>,
        rotation: Option<u16>,
        searchable_pdf_path: &Path,
        signature: &OcrSignature,
    ) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE single_documents SET \
                     ocr_text = ?1, ocr_confidence = ?2, rotation = ?3, \
                     searchable_pdf_path = ?4, sig_file_size = ?5, sig_mtime = ?6, \
                     sig_sha1_prefix = ?7, state = ?8, error = NULL, updated_at = ?9 \
                 WHERE id = ?10",
                params![
                    text,
                    confidence,
                    rotation.map(|r| r as i64),
                    searchable_pdf_path.to_string_lossy().into_owned(),
                    signature.file_size as i64,
                    signature.mtime,
                    signature.sha1_prefix,
                    DocumentState::OcrDone.as_str(),
                    now,
                    id
                ],
            )?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(format!("document {}", id)));
            }
            Ok(())
        })
    }

    /// Persist the AI classification for a document.
    pub fn store_ai_result(
        &self,
        id: i64,
        category: Option<&str>,
        filename: Option<&str>,
        summary: Option<&str>,
        confidence: Option<f64>,
    ) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE single_documents SET \
                     ai_category = ?1, ai_filename = ?2, ai_summary = ?3, \
                     ai_confidence = ?4, state = ?5, updated_at = ?6 \
                 WHERE id = ?7",
                params![
                    category,
                    filename,
                    summary,
                    confidence,
                    DocumentState::AiDone.as_str(),
                    now,
                    id
                ],
            )?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(format!("document {}", id)));
            }
            Ok(())
        })
    }

    /// Record the user's verification decision.
    pub fn set_final(&self, id: i64, category: &str, filename: &str) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE single_documents SET \
                     final_category = ?1, final_filename = ?2, state = ?3, updated_at = ?4 \
                 WHERE id = ?5",
                params![category, filename, DocumentState::Verified.as_str(), now, id],
            )?;
            Ok(())
        })
    }

    pub fn set_state(&self, id: i64, state: DocumentState) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE single_documents SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), now, id],
            )?;
            Ok(())
        })
    }

    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE single_documents SET state = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![DocumentState::Failed.as_str(), error, now, id],
            )?;
            Ok(())
        })
    }

    /// Stamp the LLM-rescan throttle clock.
    pub fn touch_llm_rescan(&self, id: i64) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE single_documents SET llm_rescanned_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(())
        })
    }

    /// Per-state document counts for one batch.
    pub fn count_by_state(&self, batch_id: i64) -> Result<Vec<(String, u64)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM single_documents WHERE batch_id = ?1 GROUP BY state",
        )?;
        let counts = stmt
            .query_map(params![batch_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

fn map_single_row(row: &Row) -> rusqlite::Result<SingleDocument> {
    let source_path: String = row.get(3)?;
    let sig_file_size: Option<i64> = row.get(7)?;
    let sig_mtime: Option<i64> = row.get(8)?;
    let sig_sha1: Option<String> = row.get(9)?;
    let signature = match (sig_file_size, sig_mtime, sig_sha1) {
        (Some(size), Some(mtime), Some(prefix)) => Some(OcrSignature {
            file_size: size as u64,
            mtime,
            sha1_prefix: prefix,
        }),
        _ => None,
    };
    let state: String = row.get(18)?;
    let created_at: String = row.get(21)?;
    let updated_at: String = row.get(22)?;

    Ok(SingleDocument {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        source_hash: row.get(2)?,
        source_path: PathBuf::from(source_path),
        page_count: row.get::<_, i64>(4)? as u32,
        ocr_text: row.get(5)?,
        ocr_confidence: row.get(6)?,
        signature,
        rotation: row.get::<_, Option<i64>>(10)?.map(|r| r as u16),
        searchable_pdf_path: row.get::<_, Option<String>>(11)?.map(PathBuf::from),
        ai_category: row.get(12)?,
        ai_filename: row.get(13)?,
        ai_summary: row.get(14)?,
        ai_confidence: row.get(15)?,
        final_category: row.get(16)?,
        final_filename: row.get(17)?,
        state: DocumentState::from_str(&state).unwrap_or(DocumentState::Failed),
        error: row.get(19)?,
        llm_rescanned_at: read_timestamp_opt(row.get(20)?),
        created_at: read_timestamp(&created_at),
        updated_at: read_timestamp(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchKind, OcrSignature};
    use crate::repository::BatchRepository;
    use tempfile::tempdir;

    fn setup() -> (BatchRepository, DocumentRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let batches = BatchRepository::new(&db).unwrap();
        let docs = DocumentRepository::new(&db).unwrap();
        (batches, docs, dir)
    }

    #[test]
    fn test_insert_or_get_is_idempotent() {
        let (batches, docs, _dir) = setup();
        let batch = batches
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        let a = docs
            .insert_or_get(batch.id, "hash1", Path::new("/intake/a.pdf"), 3)
            .unwrap();
        let b = docs
            .insert_or_get(batch.id, "hash1", Path::new("/intake/a.pdf"), 3)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.state, DocumentState::New);
    }

    #[test]
    fn test_ocr_result_roundtrip() {
        let (batches, docs, dir) = setup();
        let batch = batches
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        let doc = docs
            .insert_or_get(batch.id, "hash1", Path::new("/intake/a.pdf"), 1)
            .unwrap();

        let source = dir.path().join("a.pdf");
        std::fs::write(&source, b"%PDF-1.5 test").unwrap();
        let sig = OcrSignature::of_file(&source).unwrap();

        docs.store_ocr_result(
            doc.id,
            "extracted text",
            Some(0.91),
            Some(90),
            Path::new("/processed/a.pdf"),
            &sig,
        )
        .unwrap();

        let loaded = docs.get(doc.id).unwrap().unwrap();
        assert_eq!(loaded.state, DocumentState::OcrDone);
        assert_eq!(loaded.ocr_text.as_deref(), Some("extracted text"));
        assert_eq!(loaded.rotation, Some(90));
        assert_eq!(loaded.signature.as_ref(), Some(&sig));
    }

    #[test]
    fn test_mark_failed_stores_error() {
        let (batches, docs, _dir) = setup();
        let batch = batches
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        let doc = docs
            .insert_or_get(batch.id, "hash1", Path::new("/intake/a.pdf"), 1)
            .unwrap();
        docs.mark_failed(doc.id, "ocr engine unavailable").unwrap();
        let loaded = docs.get(doc.id).unwrap().unwrap();
        assert_eq!(loaded.state, DocumentState::Failed);
        assert_eq!(loaded.error.as_deref(), Some("ocr engine unavailable"));
    }
}
