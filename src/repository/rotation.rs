//! Per-(artifact, page) rotation overrides.
//!
//! Once set, an override is the authoritative rotation applied before OCR;
//! the auto-rotation probe is skipped for that page.

use rusqlite::params;

use super::{optional_row, retry_on_busy, DocumentRepository, Result};

/// Angles a rotation override may take.
pub const VALID_ROTATIONS: [u16; 4] = [0, 90, 180, 270];

impl DocumentRepository {
    pub fn set_rotation(&self, artifact_hash: &str, page_index: u32, angle: u16) -> Result<()> {
        debug_assert!(VALID_ROTATIONS.contains(&angle));
        retry_on_busy(|| {
            let conn = self.connect()?;
            conn.execute(
                "INSERT INTO intake_rotations (artifact_hash, page_index, angle) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(artifact_hash, page_index) DO UPDATE SET angle = excluded.angle",
                params![artifact_hash, page_index, angle],
            )?;
            Ok(())
        })
    }

    pub fn get_rotation(&self, artifact_hash: &str, page_index: u32) -> Result<Option<u16>> {
        let conn = self.connect()?;
        optional_row(conn.query_row(
            "SELECT angle FROM intake_rotations WHERE artifact_hash = ?1 AND page_index = ?2",
            params![artifact_hash, page_index],
            |row| row.get::<_, i64>(0),
        ))
        .map(|angle| angle.map(|a| a as u16))
    }

    /// All overrides for one artifact, as (page_index, angle) pairs.
    pub fn list_rotations(&self, artifact_hash: &str) -> Result<Vec<(u32, u16)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT page_index, angle FROM intake_rotations \
             WHERE artifact_hash = ?1 ORDER BY page_index",
        )?;
        let rows = stmt
            .query_map(params![artifact_hash], |row| {
                Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u16))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
