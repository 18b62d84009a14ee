//! OCR signature: invalidation key for cached OCR output.

use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::utils::sha1_first_64k;

/// (file size, mtime, SHA-1 of the first 64 KiB) of a source file.
///
/// Cached OCR text and searchable PDFs are reused only while the stored
/// signature equals the file's current signature. Size and mtime are the
/// cheap first-line check; the hash prefix catches same-size in-place edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrSignature {
    pub file_size: u64,
    pub mtime: i64,
    pub sha1_prefix: String,
}

impl OcrSignature {
    /// Compute the signature of a file on disk.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Self {
            file_size: meta.len(),
            mtime,
            sha1_prefix: sha1_first_64k(path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_signature_stable_for_unchanged_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.5 content").unwrap();
        let a = OcrSignature::of_file(&path).unwrap();
        let b = OcrSignature::of_file(&path).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_changes_with_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.5 v1").unwrap();
        let a = OcrSignature::of_file(&path).unwrap();
        std::fs::write(&path, b"%PDF-1.5 v2 longer").unwrap();
        let b = OcrSignature::of_file(&path).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.file_size, b.file_size);
    }
}
