//! Deterministic OCR engine for fast test mode.
//!
//! Never shells out: pages render to a tiny solid PNG and OCR returns text
//! derived from the image name. Call counters let tests assert that cached
//! paths performed zero OCR work.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{OcrEngine, OcrError, OcrOutput};

pub struct StubEngine {
    render_calls: AtomicUsize,
    ocr_calls: AtomicUsize,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            render_calls: AtomicUsize::new(0),
            ocr_calls: AtomicUsize::new(0),
        }
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::Relaxed)
    }

    pub fn ocr_calls(&self) -> usize {
        self.ocr_calls.load(Ordering::Relaxed)
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn render_page(
        &self,
        _pdf: &Path,
        page_index: u32,
        _scale: f32,
        out_dir: &Path,
    ) -> Result<PathBuf, OcrError> {
        self.render_calls.fetch_add(1, Ordering::Relaxed);
        let path = out_dir.join(format!("page-{:02}.png", page_index + 1));
        let img = image::ImageBuffer::from_pixel(8, 8, image::Rgb([255u8, 255, 255]));
        img.save(&path)
            .map_err(|e| OcrError::RenderFailed(e.to_string()))?;
        Ok(path)
    }

    fn ocr_image(&self, image: &Path) -> Result<OcrOutput, OcrError> {
        self.ocr_calls.fetch_add(1, Ordering::Relaxed);
        let stem = image
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("page");
        Ok(OcrOutput {
            text: format!("Stub OCR text for {}", stem),
            confidence: Some(99.0),
            words: Vec::new(),
            processing_time_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stub_counts_calls() {
        let dir = tempdir().unwrap();
        let engine = StubEngine::new();
        let image = engine
            .render_page(Path::new("/fake.pdf"), 0, 2.0, dir.path())
            .unwrap();
        assert!(image.exists());
        let out = engine.ocr_image(&image).unwrap();
        assert!(out.text.contains("page-01"));
        assert_eq!(engine.render_calls(), 1);
        assert_eq!(engine.ocr_calls(), 1);
    }
}
