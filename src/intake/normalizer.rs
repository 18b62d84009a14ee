//! Content-addressed normalized PDF cache.
//!
//! Every artifact resolves to exactly one normalized PDF per content hash.
//! PDFs are their own normalization; images are rendered into a single-page
//! PDF once and reused across runs. Sidecar `.atime` stamps drive the age
//! based garbage collector.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::NORMALIZE_JPEG_QUALITY;
use crate::models::ArtifactKind;
use crate::pdf;

use super::IntakeError;

/// Result of normalizing one artifact.
#[derive(Debug, Clone)]
pub struct NormalizedOutcome {
    pub path: PathBuf,
    /// True when the cache already held this content hash.
    pub reused: bool,
}

#[derive(Clone)]
pub struct Normalizer {
    cache_dir: PathBuf,
    dpi: u32,
}

impl Normalizer {
    pub fn new(cache_dir: PathBuf, dpi: u32) -> Self {
        Self { cache_dir, dpi }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache entry for a content hash. Present after the first scan of any
    /// artifact with that content; deletable at any time and rebuilt lazily.
    pub fn cached_path(&self, content_hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.pdf", content_hash))
    }

    fn sidecar_path(&self, content_hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.pdf.atime", content_hash))
    }

    /// Produce the canonical PDF for an artifact.
    pub fn normalize(
        &self,
        path: &Path,
        kind: ArtifactKind,
        content_hash: &str,
    ) -> Result<NormalizedOutcome, IntakeError> {
        match kind {
            ArtifactKind::Pdf => {
                // The file itself is the normalized PDF. It is still
                // mirrored into the cache so later stages (grouped export,
                // rotated serving) can resolve the content by hash after
                // the intake directory moves on; `reused` reflects whether
                // this content has been through the cache before.
                let cached = self.cached_path(content_hash);
                if cached.exists() {
                    self.touch(content_hash);
                    return Ok(NormalizedOutcome {
                        path: path.to_path_buf(),
                        reused: true,
                    });
                }
                std::fs::create_dir_all(&self.cache_dir)?;
                let tmp = self.cache_dir.join(format!(".{}.pdf.tmp", content_hash));
                std::fs::copy(path, &tmp)?;
                if std::fs::rename(&tmp, &cached).is_err() && !cached.exists() {
                    let _ = std::fs::remove_file(&tmp);
                }
                self.touch(content_hash);
                Ok(NormalizedOutcome {
                    path: path.to_path_buf(),
                    reused: false,
                })
            }
            ArtifactKind::Image => self.normalize_image(path, content_hash),
            ArtifactKind::Unknown => {
                Err(IntakeError::Unsupported(path.display().to_string()))
            }
        }
    }

    fn normalize_image(
        &self,
        path: &Path,
        content_hash: &str,
    ) -> Result<NormalizedOutcome, IntakeError> {
        let target = self.cached_path(content_hash);
        if target.exists() {
            self.touch(content_hash);
            return Ok(NormalizedOutcome {
                path: target,
                reused: true,
            });
        }

        std::fs::create_dir_all(&self.cache_dir)?;
        let tmp = self.cache_dir.join(format!(".{}.pdf.tmp", content_hash));
        pdf::image_to_pdf(path, &tmp, self.dpi, NORMALIZE_JPEG_QUALITY)?;

        // Atomic publish; same-hash racers produce equivalent bytes, so
        // last-rename-wins is fine. One retry on rename failure.
        if let Err(first) = std::fs::rename(&tmp, &target) {
            tracing::debug!("normalized rename retry for {}: {}", content_hash, first);
            if std::fs::rename(&tmp, &target).is_err() && !target.exists() {
                let _ = std::fs::remove_file(&tmp);
                return Err(IntakeError::Io(first));
            }
        }
        self.touch(content_hash);

        Ok(NormalizedOutcome {
            path: target,
            reused: false,
        })
    }

    /// Update the last-access stamp for a cache entry.
    pub fn touch(&self, content_hash: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Err(e) = std::fs::write(self.sidecar_path(content_hash), now.to_string()) {
            tracing::debug!("atime sidecar write failed for {}: {}", content_hash, e);
        }
    }

    fn last_access(&self, entry: &Path) -> Option<u64> {
        let hash = entry.file_stem()?.to_str()?;
        let sidecar = self.sidecar_path(hash);
        if let Ok(raw) = std::fs::read_to_string(&sidecar) {
            if let Ok(stamp) = raw.trim().parse() {
                return Some(stamp);
            }
        }
        // No sidecar: fall back to the file's own mtime
        std::fs::metadata(entry)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
    }

    /// Delete entries whose last access is older than `max_age_days`.
    /// Rotated variants and sidecars go with their entry. Returns the
    /// number of cache entries removed.
    pub fn gc(&self, max_age_days: u64) -> std::io::Result<usize> {
        let cutoff = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .saturating_sub(max_age_days * 24 * 3600);

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".pdf") || name.contains("_r") {
                continue;
            }
            let Some(last) = self.last_access(&path) else {
                continue;
            };
            if last >= cutoff {
                continue;
            }

            let hash = name.trim_end_matches(".pdf");
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_file(self.sidecar_path(hash));
            for angle in [90u16, 180, 270] {
                let _ = std::fs::remove_file(
                    self.cache_dir.join(format!("{}_r{}.pdf", hash, angle)),
                );
            }
            removed += 1;
        }
        if removed > 0 {
            tracing::info!("Normalized cache GC removed {} entries", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sha256_file;
    use tempfile::tempdir;

    fn write_image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let img = image::ImageBuffer::from_pixel(20, 20, image::Rgb([128u8, 128, 128]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_image_normalization_is_idempotent() {
        let dir = tempdir().unwrap();
        let image = write_image(dir.path(), "photo.png");
        let hash = sha256_file(&image).unwrap();
        let normalizer = Normalizer::new(dir.path().join("cache"), 150);

        let first = normalizer
            .normalize(&image, ArtifactKind::Image, &hash)
            .unwrap();
        assert!(!first.reused);
        let bytes = std::fs::read(&first.path).unwrap();

        // Same content at a different path reuses the cache entry untouched
        let copy = write_image(dir.path(), "photo_copy.png");
        let copy_hash = sha256_file(&copy).unwrap();
        assert_eq!(hash, copy_hash);
        let second = normalizer
            .normalize(&copy, ArtifactKind::Image, &copy_hash)
            .unwrap();
        assert!(second.reused);
        assert_eq!(first.path, second.path);
        assert_eq!(std::fs::read(&second.path).unwrap(), bytes);
    }

    #[test]
    fn test_pdf_is_its_own_normalization() {
        let dir = tempdir().unwrap();
        let pdf_path = dir.path().join("doc.pdf");
        let image = write_image(dir.path(), "page.png");
        pdf::image_to_pdf(&image, &pdf_path, 150, 95).unwrap();
        let hash = sha256_file(&pdf_path).unwrap();

        let normalizer = Normalizer::new(dir.path().join("cache"), 150);
        let outcome = normalizer
            .normalize(&pdf_path, ArtifactKind::Pdf, &hash)
            .unwrap();
        assert_eq!(outcome.path, pdf_path);
        assert!(!outcome.reused);
    }

    #[test]
    fn test_gc_removes_stale_entries() {
        let dir = tempdir().unwrap();
        let image = write_image(dir.path(), "photo.png");
        let hash = sha256_file(&image).unwrap();
        let normalizer = Normalizer::new(dir.path().join("cache"), 150);
        let outcome = normalizer
            .normalize(&image, ArtifactKind::Image, &hash)
            .unwrap();

        // Backdate the sidecar far past any cutoff
        std::fs::write(
            normalizer.sidecar_path(&hash),
            "100",
        )
        .unwrap();
        let removed = normalizer.gc(1).unwrap();
        assert_eq!(removed, 1);
        assert!(!outcome.path.exists());

        // Fresh entries survive
        let outcome = normalizer
            .normalize(&image, ArtifactKind::Image, &hash)
            .unwrap();
        assert_eq!(normalizer.gc(1).unwrap(), 0);
        assert!(outcome.path.exists());
    }
}
