//! Grouped-document persistence: carved documents, their pages, and the
//! per-artifact page texts the grouping UI carves from.

use chrono::Utc;
use rusqlite::{params, Row};

use crate::models::{DocumentState, GroupedDocument, GroupedPage};

use super::{read_timestamp, optional_row, retry_on_busy, DocumentRepository, RepositoryError, Result};

impl DocumentRepository {
    /// Create a named grouped document within a batch.
    pub fn create_grouped_document(
        &self,
        batch_id: i64,
        name: &str,
        position: u32,
    ) -> Result<i64> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO grouped_documents (batch_id, name, position, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![batch_id, name, position, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Append a page to a grouped document.
    pub fn add_grouped_page(
        &self,
        document_id: i64,
        artifact_hash: &str,
        page_index: u32,
        category: Option<&str>,
        rotation: Option<u16>,
        position: u32,
    ) -> Result<i64> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            // Carry the page's OCR text over from the intake table
            let ocr_text: Option<String> = optional_row(conn.query_row(
                "SELECT ocr_text FROM intake_pages WHERE artifact_hash = ?1 AND page_index = ?2",
                params![artifact_hash, page_index],
                |row| row.get(0),
            ))?
            .flatten();
            conn.execute(
                "INSERT INTO grouped_pages \
                     (document_id, artifact_hash, page_index, category, rotation, ocr_text, position) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    document_id,
                    artifact_hash,
                    page_index,
                    category,
                    rotation.map(|r| r as i64),
                    ocr_text,
                    position
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_grouped(&self, id: i64) -> Result<Option<GroupedDocument>> {
        let conn = self.connect()?;
        let doc = optional_row(conn.query_row(
            "SELECT id, batch_id, name, final_category, position, state, created_at, updated_at \
             FROM grouped_documents WHERE id = ?1",
            params![id],
            map_grouped_row,
        ))?;
        match doc {
            Some(mut doc) => {
                doc.pages = self.grouped_pages(&conn, doc.id)?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    pub fn list_grouped_by_batch(&self, batch_id: i64) -> Result<Vec<GroupedDocument>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, batch_id, name, final_category, position, state, created_at, updated_at \
             FROM grouped_documents WHERE batch_id = ?1 ORDER BY position, id",
        )?;
        let mut docs = stmt
            .query_map(params![batch_id], map_grouped_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for doc in &mut docs {
            doc.pages = self.grouped_pages(&conn, doc.id)?;
        }
        Ok(docs)
    }

    fn grouped_pages(
        &self,
        conn: &rusqlite::Connection,
        document_id: i64,
    ) -> Result<Vec<GroupedPage>> {
        let mut stmt = conn.prepare(
            "SELECT id, document_id, artifact_hash, page_index, category, rotation, ocr_text, position \
             FROM grouped_pages WHERE document_id = ?1 ORDER BY position, id",
        )?;
        let pages = stmt
            .query_map(params![document_id], |row| {
                Ok(GroupedPage {
                    id: row.get(0)?,
                    document_id: row.get(1)?,
                    artifact_hash: row.get(2)?,
                    page_index: row.get::<_, i64>(3)? as u32,
                    category: row.get(4)?,
                    rotation: row.get::<_, Option<i64>>(5)?.map(|r| r as u16),
                    ocr_text: row.get(6)?,
                    position: row.get::<_, i64>(7)? as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pages)
    }

    pub fn set_grouped_category(&self, id: i64, category: &str) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE grouped_documents SET final_category = ?1, updated_at = ?2 WHERE id = ?3",
                params![category, now, id],
            )?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(format!("grouped document {}", id)));
            }
            Ok(())
        })
    }

    pub fn set_grouped_state(&self, id: i64, state: DocumentState) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE grouped_documents SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), now, id],
            )?;
            Ok(())
        })
    }

    /// Store per-page OCR output for a batch-scan artifact. Pages are OCR'd
    /// once here and reused when the user carves documents out of them.
    pub fn upsert_intake_page(
        &self,
        artifact_hash: &str,
        page_index: u32,
        ocr_text: &str,
        ocr_confidence: Option<f64>,
    ) -> Result<()> {
        retry_on_busy(|| {
            let conn = self.connect()?;
            conn.execute(
                "INSERT INTO intake_pages (artifact_hash, page_index, ocr_text, ocr_confidence) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(artifact_hash, page_index) DO UPDATE SET \
                     ocr_text = excluded.ocr_text, ocr_confidence = excluded.ocr_confidence",
                params![artifact_hash, page_index, ocr_text, ocr_confidence],
            )?;
            Ok(())
        })
    }

    pub fn get_intake_page(
        &self,
        artifact_hash: &str,
        page_index: u32,
    ) -> Result<Option<(String, Option<f64>)>> {
        let conn = self.connect()?;
        optional_row(conn.query_row(
            "SELECT ocr_text, ocr_confidence FROM intake_pages \
             WHERE artifact_hash = ?1 AND page_index = ?2",
            params![artifact_hash, page_index],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    row.get(1)?,
                ))
            },
        ))
    }

    /// Count of intake pages already OCR'd for an artifact.
    pub fn count_intake_pages(&self, artifact_hash: &str) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM intake_pages WHERE artifact_hash = ?1",
            params![artifact_hash],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn map_grouped_row(row: &Row) -> rusqlite::Result<GroupedDocument> {
    let state: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(GroupedDocument {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        name: row.get(2)?,
        final_category: row.get(3)?,
        position: row.get::<_, i64>(4)? as u32,
        state: DocumentState::from_str(&state).unwrap_or(DocumentState::Failed),
        pages: Vec::new(),
        created_at: read_timestamp(&created_at),
        updated_at: read_timestamp(&updated_at),
    })
}
