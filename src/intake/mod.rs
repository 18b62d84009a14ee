//! Intake scanning: artifact discovery, kind detection, and normalization.

mod detector;
mod normalizer;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use detector::IntakeDetector;
pub use normalizer::{NormalizedOutcome, Normalizer};

use crate::pdf::PdfError;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Unsupported file kind: {0}")]
    Unsupported(String),

    #[error("Unreadable input: {0}")]
    Unreadable(String),

    #[error("Corrupt PDF: {0}")]
    Corrupt(String),

    #[error("Normalization failed: {0}")]
    Pdf(#[from] PdfError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extensions the intake scan considers. Everything else is ignored.
const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "png", "jpg", "jpeg"];

/// List processable files in the intake directory, sorted by name for a
/// stable processing order. Files are never mutated or deleted.
pub fn scan_intake_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempdir().unwrap();
        for name in ["b.pdf", "a.PNG", "notes.txt", "c.jpeg", ".hidden"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.pdf")).unwrap();

        let files = scan_intake_dir(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.PNG", "b.pdf", "c.jpeg"]);
    }
}
