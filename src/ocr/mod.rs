//! Pluggable OCR engines.
//!
//! An engine does exactly two things: render a PDF page to an image, and
//! OCR an image. Engine swap is by configuration; `fast_test_mode` selects
//! the deterministic stub so tests never shell out.

mod stub;
mod tesseract;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use thiserror::Error;

use crate::config::Settings;

pub use stub::StubEngine;
pub use tesseract::TesseractEngine;

/// Errors that can occur during rendering or OCR.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("OCR failed: {0}")]
    OcrFailed(String),

    #[error("OCR timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A word recognized by the engine, with its box in rendered-image pixels.
#[derive(Debug, Clone)]
pub struct WordBox {
    pub text: String,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f64,
}

/// Result of OCR on one image.
#[derive(Debug, Clone)]
pub struct OcrOutput {
    pub text: String,
    /// Mean word confidence in [0, 100], when the engine reports one.
    pub confidence: Option<f64>,
    pub words: Vec<WordBox>,
    pub processing_time_ms: u64,
}

/// A text extractor with a page renderer. Implementations are synchronous;
/// callers run them on blocking tasks.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Render one zero-based PDF page into `out_dir` as a PNG at
    /// `scale × 72` DPI. Returns the image path.
    fn render_page(
        &self,
        pdf: &Path,
        page_index: u32,
        scale: f32,
        out_dir: &Path,
    ) -> Result<PathBuf, OcrError>;

    /// Run OCR on an image file.
    fn ocr_image(&self, image: &Path) -> Result<OcrOutput, OcrError>;
}

/// Select the engine for the current configuration.
pub fn engine_for(settings: &Settings) -> Arc<dyn OcrEngine> {
    if settings.fast_test_mode {
        Arc::new(StubEngine::new())
    } else {
        Arc::new(TesseractEngine::new())
    }
}

/// Check if a binary is available in PATH.
pub(crate) fn check_binary(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Find the image pdftoppm generated for a page. pdftoppm pads the page
/// number to 2-4 digits depending on the document size.
pub(crate) fn find_page_image(out_dir: &Path, page_number: u32) -> Option<PathBuf> {
    for digits in [2, 3, 4, 1] {
        let filename = format!("page-{:0width$}.png", page_number, width = digits);
        let path = out_dir.join(&filename);
        if path.exists() {
            return Some(path);
        }
    }
    None
}
