//! Shared helpers: content hashing and artifact kind detection.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::models::ArtifactKind;

/// Number of leading bytes hashed for OCR signatures.
pub const SIGNATURE_PREFIX_LEN: usize = 64 * 1024;

/// Compute the SHA-256 hash of a file, streaming in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 hash of a byte slice.
pub fn sha256_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// SHA-1 of the first 64 KiB of a file, used in OCR signatures.
pub fn sha1_first_64k(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; SIGNATURE_PREFIX_LEN];
    let mut total = 0;
    while total < buffer.len() {
        let read = file.read(&mut buffer[total..])?;
        if read == 0 {
            break;
        }
        total += read;
    }
    let mut hasher = Sha1::new();
    hasher.update(&buffer[..total]);
    Ok(hex::encode(hasher.finalize()))
}

/// Detect the artifact kind from file content, falling back to the extension.
///
/// Only PDFs and common raster images are processable; everything else is
/// `Unknown` and skipped by the intake scan.
pub fn detect_artifact_kind(path: &Path) -> ArtifactKind {
    // Magic-byte detection first (an 8 KiB prefix is enough for infer)
    if let Ok(mut file) = File::open(path) {
        let mut buffer = [0u8; 8192];
        if let Ok(read) = file.read(&mut buffer) {
            if read > 0 {
                if let Some(detected) = infer::get(&buffer[..read]) {
                    match detected.mime_type() {
                        "application/pdf" => return ArtifactKind::Pdf,
                        "image/png" | "image/jpeg" => return ArtifactKind::Image,
                        _ => return ArtifactKind::Unknown,
                    }
                }
            }
        }
    }

    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => ArtifactKind::Pdf,
        Some("png") | Some("jpg") | Some("jpeg") => ArtifactKind::Image,
        _ => ArtifactKind::Unknown,
    }
}
