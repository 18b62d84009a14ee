//! Intake kind detection and single-vs-batch strategy scoring.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;

use crate::llm::Classifier;
use crate::models::{Analysis, ArtifactKind, ProcessingStrategy};
use crate::ocr::OcrEngine;
use crate::pdf;
use crate::utils::{detect_artifact_kind, sha256_file};

use super::{IntakeError, Normalizer};

/// Score margin at or below which the LLM classifier is consulted.
const CLOSE_MARGIN: i32 = 2;

/// Heuristic confidence below which the LLM classifier is consulted.
const LOW_CONFIDENCE: f64 = 0.7;

pub struct IntakeDetector {
    normalizer: Normalizer,
    classifier: Arc<dyn Classifier>,
    engine: Arc<dyn OcrEngine>,
    batch_tokens: Regex,
    single_tokens: Regex,
}

impl IntakeDetector {
    pub fn new(
        normalizer: Normalizer,
        classifier: Arc<dyn Classifier>,
        engine: Arc<dyn OcrEngine>,
    ) -> Self {
        Self {
            normalizer,
            classifier,
            engine,
            batch_tokens: Regex::new(r"(?i)\b(scan|scans|batch|combined|stack|mixed|bundle)\b")
                .unwrap_or_else(|e| unreachable!("static regex: {e}")),
            single_tokens: Regex::new(
                r"(?i)\b(invoice|receipt|letter|statement|contract|report|tax|form|bill)\b",
            )
            .unwrap_or_else(|e| unreachable!("static regex: {e}")),
        }
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Analyze one intake file: kind, normalization, sampling, strategy.
    pub async fn analyze(&self, path: &Path) -> Result<Analysis, IntakeError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| IntakeError::Unreadable(format!("{}: {}", path.display(), e)))?;
        if meta.len() == 0 {
            return Err(IntakeError::Unreadable(format!(
                "{}: zero-byte file",
                path.display()
            )));
        }
        let size_mb = meta.len() as f64 / (1024.0 * 1024.0);

        let kind = detect_artifact_kind(path);
        if kind == ArtifactKind::Unknown {
            return Err(IntakeError::Unsupported(path.display().to_string()));
        }

        let content_hash = sha256_file(path)
            .map_err(|e| IntakeError::Unreadable(format!("{}: {}", path.display(), e)))?;
        let normalized = self.normalizer.normalize(path, kind, &content_hash)?;

        let page_count = pdf::page_count(&normalized.path)
            .map_err(|e| IntakeError::Corrupt(format!("{}: {}", path.display(), e)))?;

        let mut reasoning = Vec::new();

        // Raw intake images are always one logical document: the scan app
        // emits one image per capture, and cache reuse keys off that.
        if kind == ArtifactKind::Image {
            reasoning.push("image intake is always a single document".to_string());
            return Ok(Analysis {
                path: path.to_path_buf(),
                kind,
                content_hash,
                page_count,
                size_mb,
                normalized_path: normalized.path,
                reused: normalized.reused,
                strategy: ProcessingStrategy::SingleDocument,
                confidence: 1.0,
                reasoning,
                llm_annotation: None,
            });
        }

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        let samples = self.sample_texts(&normalized.path, page_count, &mut reasoning);

        let (mut single_score, mut batch_score) =
            self.heuristic_scores(filename, page_count, size_mb, &samples, &mut reasoning);

        let margin = (single_score - batch_score).abs();
        let mut confidence = heuristic_confidence(margin);
        let mut llm_annotation = None;

        let consult = margin <= CLOSE_MARGIN
            || confidence < LOW_CONFIDENCE
            || (5..=20).contains(&page_count);
        if consult {
            match self
                .classifier
                .analyze_document_type(&samples, filename, page_count, size_mb)
                .await
            {
                Ok(analysis) => {
                    // The LLM votes with weight proportional to its confidence
                    let weight = (analysis.confidence / 25.0).round() as i32;
                    match analysis.classification {
                        ProcessingStrategy::SingleDocument => single_score += weight,
                        ProcessingStrategy::BatchScan => batch_score += weight,
                    }
                    reasoning.push(format!(
                        "llm voted {} at {:.0}%",
                        analysis.classification.as_str(),
                        analysis.confidence
                    ));
                    llm_annotation = Some(analysis.reasoning);
                    confidence = heuristic_confidence((single_score - batch_score).abs());
                }
                Err(e) => {
                    tracing::warn!("document-type analysis unavailable: {}", e);
                    reasoning.push("llm classifier unavailable".to_string());
                }
            }
        }

        // Ties break toward batch_scan: mis-splitting one document is
        // recoverable in grouping, a merged stack is not.
        let strategy = if single_score > batch_score {
            ProcessingStrategy::SingleDocument
        } else {
            ProcessingStrategy::BatchScan
        };
        reasoning.push(format!(
            "scores single={} batch={}",
            single_score, batch_score
        ));

        Ok(Analysis {
            path: path.to_path_buf(),
            kind,
            content_hash,
            page_count,
            size_mb,
            normalized_path: normalized.path,
            reused: normalized.reused,
            strategy,
            confidence,
            reasoning,
            llm_annotation,
        })
    }

    /// Multi-point sampling: page 1; pages 1 and last; or first/middle/last.
    /// Falls back to OCR when the embedded text layer is empty.
    fn sample_texts(
        &self,
        normalized: &Path,
        page_count: u32,
        reasoning: &mut Vec<String>,
    ) -> Vec<String> {
        let indices: Vec<u32> = match page_count {
            0 => vec![],
            1 => vec![0],
            2 => vec![0, 1],
            n => vec![0, n / 2, n - 1],
        };

        let mut samples = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(text) = pdf::embedded_page_text(normalized, index) {
                samples.push(text);
                continue;
            }
            match self.ocr_sample(normalized, index) {
                Some(text) => {
                    reasoning.push(format!("page {} sampled via ocr", index + 1));
                    samples.push(text);
                }
                None => {
                    reasoning.push(format!("page {} sample unavailable", index + 1));
                    samples.push(String::new());
                }
            }
        }
        samples
    }

    fn ocr_sample(&self, normalized: &Path, page_index: u32) -> Option<String> {
        let scratch = tempfile::TempDir::new().ok()?;
        let image = self
            .engine
            .render_page(normalized, page_index, 2.0, scratch.path())
            .ok()?;
        self.engine.ocr_image(&image).ok().map(|o| o.text)
    }

    fn heuristic_scores(
        &self,
        filename: &str,
        page_count: u32,
        size_mb: f64,
        samples: &[String],
        reasoning: &mut Vec<String>,
    ) -> (i32, i32) {
        let mut single = 0;
        let mut batch = 0;

        // Underscores and dashes are word characters to the regex engine,
        // so split the filename into plain tokens first
        let tokens = filename
            .to_lowercase()
            .replace(['_', '-', '.'], " ");
        if self.batch_tokens.is_match(&tokens) {
            batch += 3;
            reasoning.push("filename suggests batch scan".to_string());
        }
        if self.single_tokens.is_match(&tokens) {
            single += 2;
            reasoning.push("filename names a document type".to_string());
        }

        match page_count {
            0..=2 => {
                single += 2;
                reasoning.push("low page count".to_string());
            }
            3..=4 => single += 1,
            5..=9 => batch += 1,
            _ => {
                batch += 2;
                reasoning.push("high page count".to_string());
            }
        }

        if size_mb > 10.0 {
            batch += 1;
            reasoning.push("large file".to_string());
        }

        if samples.len() >= 2 {
            let similarity = token_similarity(
                samples.first().map(String::as_str).unwrap_or(""),
                samples.last().map(String::as_str).unwrap_or(""),
            );
            if similarity >= 0.3 {
                single += 2;
                reasoning.push("samples are consistent".to_string());
            } else if similarity < 0.1 {
                batch += 2;
                reasoning.push("samples diverge".to_string());
            } else {
                batch += 1;
            }
        }

        (single, batch)
    }
}

fn heuristic_confidence(margin: i32) -> f64 {
    (0.5 + margin.min(6) as f64 * 0.08).min(0.98)
}

/// Jaccard similarity over lowercase word sets.
fn token_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let set_a: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let set_b: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FallbackClassifier;
    use crate::ocr::StubEngine;
    use tempfile::tempdir;

    fn detector(cache: &Path) -> IntakeDetector {
        IntakeDetector::new(
            Normalizer::new(cache.to_path_buf(), 150),
            Arc::new(FallbackClassifier::new()),
            Arc::new(StubEngine::new()),
        )
    }

    fn write_image(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let img = image::ImageBuffer::from_pixel(16, 16, image::Rgb([200u8, 200, 200]));
        img.save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_images_are_single_document() {
        let dir = tempdir().unwrap();
        let image = write_image(dir.path(), "photo.png");
        let detector = detector(&dir.path().join("cache"));
        let analysis = detector.analyze(&image).await.unwrap();
        assert_eq!(analysis.kind, ArtifactKind::Image);
        assert_eq!(analysis.strategy, ProcessingStrategy::SingleDocument);
        assert_eq!(analysis.page_count, 1);
        assert!((analysis.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_zero_byte_file_is_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.pdf");
        std::fs::write(&path, b"").unwrap();
        let detector = detector(&dir.path().join("cache"));
        assert!(matches!(
            detector.analyze(&path).await,
            Err(IntakeError::Unreadable(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"some notes").unwrap();
        let detector = detector(&dir.path().join("cache"));
        assert!(matches!(
            detector.analyze(&path).await,
            Err(IntakeError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_pdf_fails_analysis() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.5 this is not a real pdf body").unwrap();
        let detector = detector(&dir.path().join("cache"));
        assert!(matches!(
            detector.analyze(&path).await,
            Err(IntakeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_token_similarity() {
        assert!(token_similarity("invoice acme total", "invoice acme due") > 0.3);
        assert!(token_similarity("alpha beta", "gamma delta") < 0.1);
        assert_eq!(token_similarity("", ""), 0.0);
    }

    #[test]
    fn test_filename_tokens_shift_scores() {
        let dir = tempdir().unwrap();
        let detector = detector(&dir.path().join("cache"));
        let mut reasoning = Vec::new();
        let (single, batch) =
            detector.heuristic_scores("batch_scan_march.pdf", 9, 1.0, &[], &mut reasoning);
        assert!(batch > single);

        let mut reasoning = Vec::new();
        let (single, batch) =
            detector.heuristic_scores("invoice_acme.pdf", 2, 0.2, &[], &mut reasoning);
        assert!(single > batch);
    }
}
