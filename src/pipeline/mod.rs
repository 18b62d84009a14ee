//! The OCR/AI document pipeline.
//!
//! Every expensive step is idempotent and resumable: OCR output is gated by
//! an `OcrSignature` so repeated invocations of an unchanged document are
//! pure cache reads, rotation overrides skip the orientation probe, and LLM
//! failures leave classification fields null instead of failing the run.

mod rotation;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use thiserror::Error;

use crate::config::Settings;
use crate::intake::{IntakeError, Normalizer};
use crate::llm::Classifier;
use crate::models::{OcrSignature, RescanMode, SingleDocument};
use crate::ocr::{OcrEngine, OcrError, OcrOutput};
use crate::pdf::{self, PageSpec, PdfError};
use crate::repository::{DocumentRepository, RepositoryError};
use crate::utils::detect_artifact_kind;

pub use rotation::{orientation_score, rotate_image_file};

/// Minimum spacing between LLM rescans of one document.
const RESCAN_THROTTLE: Duration = Duration::from_secs(5);

/// Retry delays after a failed OCR attempt.
const OCR_RETRY_DELAYS: [u64; 2] = [1, 4];

/// JPEG quality for searchable-PDF page rasters.
const SEARCHABLE_JPEG_QUALITY: u8 = 85;

/// Cooperative cancellation flag, shared between an orchestration run and
/// its workers. Cancellation is best-effort and idempotent.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),

    #[error("PDF error: {0}")]
    Pdf(#[from] PdfError),

    #[error("Store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Rescan throttled; retry in a few seconds")]
    Throttled,

    #[error("Not found: {0}")]
    NotFound(String),
}

/// AI classification fields produced for a document.
#[derive(Debug, Clone)]
pub struct AiFields {
    pub category: String,
    pub filename: Option<String>,
    pub summary: Option<String>,
    pub confidence: f64,
}

/// Result of running the pipeline over one single document.
#[derive(Debug)]
pub struct SingleOutcome {
    /// True when the stored signature matched and OCR was skipped entirely.
    pub cached: bool,
    pub ocr_text: String,
    pub confidence: Option<f64>,
    pub rotation: Option<u16>,
    pub searchable_pdf: PathBuf,
    pub ai: Option<AiFields>,
    /// Pages that failed OCR after retries; the document still completes.
    pub page_errors: Vec<(u32, String)>,
}

/// Result of OCR'ing the pages of a batch-scan artifact.
#[derive(Debug, Default)]
pub struct BatchScanOutcome {
    pub pages_done: u32,
    pub pages_cached: u32,
    pub page_errors: Vec<(u32, String)>,
}

struct PageOcr {
    text: String,
    confidence: Option<f64>,
    angle: u16,
    image: PathBuf,
}

pub struct DocumentPipeline {
    store: DocumentRepository,
    engine: Arc<dyn OcrEngine>,
    classifier: Arc<dyn Classifier>,
    normalizer: Normalizer,
    processed_dir: PathBuf,
    render_scale: f32,
    overlay_limit: usize,
    ocr_timeout: Duration,
    probe_count: AtomicUsize,
    ocr_count: AtomicUsize,
}

impl DocumentPipeline {
    pub fn new(
        settings: &Settings,
        store: DocumentRepository,
        engine: Arc<dyn OcrEngine>,
        classifier: Arc<dyn Classifier>,
        normalizer: Normalizer,
    ) -> Self {
        Self {
            store,
            engine,
            classifier,
            normalizer,
            processed_dir: settings.processed_dir(),
            render_scale: settings.ocr_render_scale,
            overlay_limit: settings.ocr_overlay_text_limit,
            ocr_timeout: Duration::from_secs(settings.ocr_timeout_secs),
            probe_count: AtomicUsize::new(0),
            ocr_count: AtomicUsize::new(0),
        }
    }

    /// Rotation probes run so far. Tests assert carry-forward through this.
    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::Relaxed)
    }

    /// OCR engine invocations so far. Tests assert cache hits through this.
    pub fn ocr_calls(&self) -> usize {
        self.ocr_count.load(Ordering::Relaxed)
    }

    /// Run the full OCR + classification pipeline for a single document.
    pub async fn process_single(
        &self,
        doc: &SingleDocument,
        normalized: &Path,
        forced_rotation: Option<u16>,
        cancel: &CancelFlag,
    ) -> Result<SingleOutcome, PipelineError> {
        self.process_single_inner(doc, normalized, forced_rotation, cancel, false, true)
            .await
    }

    async fn process_single_inner(
        &self,
        doc: &SingleDocument,
        normalized: &Path,
        forced_rotation: Option<u16>,
        cancel: &CancelFlag,
        ignore_cache: bool,
        classify: bool,
    ) -> Result<SingleOutcome, PipelineError> {
        let signature = OcrSignature::of_file(&doc.source_path)?;
        let cache_hit = !ignore_cache
            && doc.signature.as_ref() == Some(&signature)
            && doc
                .searchable_pdf_path
                .as_ref()
                .map(|p| p.exists())
                .unwrap_or(false);

        let (ocr_text, confidence, applied_rotation, searchable_pdf, page_errors) = if cache_hit {
            tracing::debug!("document {}: OCR signature unchanged, cache hit", doc.id);
            (
                doc.ocr_text.clone().unwrap_or_default(),
                doc.ocr_confidence,
                doc.rotation,
                doc.searchable_pdf_path
                    .clone()
                    .unwrap_or_default(),
                Vec::new(),
            )
        } else {
            let produced = self
                .ocr_document(doc, normalized, forced_rotation, cancel)
                .await?;
            self.store.store_ocr_result(
                doc.id,
                &produced.0,
                produced.1,
                produced.2,
                &produced.3,
                &signature,
            )?;
            produced
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let source_changed = !cache_hit;
        let ai = if classify {
            self.classify(doc, &ocr_text, source_changed).await
        } else {
            None
        };
        if let Some(fields) = &ai {
            self.store.store_ai_result(
                doc.id,
                Some(&fields.category),
                fields.filename.as_deref(),
                fields.summary.as_deref(),
                Some(fields.confidence),
            )?;
        }

        Ok(SingleOutcome {
            cached: cache_hit,
            ocr_text,
            confidence,
            rotation: applied_rotation,
            searchable_pdf,
            ai,
            page_errors,
        })
    }

    /// OCR every page of a batch-scan artifact into the intake page store.
    /// Pages already present are cache hits and skipped.
    pub async fn process_batch_scan(
        &self,
        artifact_hash: &str,
        normalized: &Path,
        page_count: u32,
        cancel: &CancelFlag,
    ) -> Result<BatchScanOutcome, PipelineError> {
        let scratch = TempDir::new()?;
        let mut outcome = BatchScanOutcome::default();

        for page_index in 0..page_count.max(1) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self
                .store
                .get_intake_page(artifact_hash, page_index)?
                .is_some()
            {
                outcome.pages_cached += 1;
                continue;
            }

            let override_angle = self.store.get_rotation(artifact_hash, page_index)?;
            match self
                .ocr_page(normalized, page_index, override_angle, scratch.path(), cancel)
                .await
            {
                Ok(page) => {
                    self.store.upsert_intake_page(
                        artifact_hash,
                        page_index,
                        &page.text,
                        page.confidence,
                    )?;
                    outcome.pages_done += 1;
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        "page {} of {} failed: {}",
                        page_index + 1,
                        artifact_hash,
                        e
                    );
                    outcome.page_errors.push((page_index, e.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    /// Re-execute OCR and/or classification for one document.
    pub async fn rescan(
        &self,
        doc_id: i64,
        mode: RescanMode,
        cancel: &CancelFlag,
    ) -> Result<SingleOutcome, PipelineError> {
        let doc = self
            .store
            .get(doc_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("document {}", doc_id)))?;

        match mode {
            RescanMode::Ocr => {
                // OCR only: AI fields are kept as they are
                let normalized = self.normalized_path_for(&doc)?;
                self.process_single_inner(&doc, &normalized, None, cancel, true, false)
                    .await
            }
            RescanMode::OcrAndLlm => {
                self.check_rescan_throttle(&doc)?;
                self.store.touch_llm_rescan(doc.id)?;
                let normalized = self.normalized_path_for(&doc)?;
                self.process_single_inner(&doc, &normalized, None, cancel, true, true)
                    .await
            }
            RescanMode::LlmOnly => self.rescan_llm_only(&doc, cancel).await,
        }
    }

    /// LLM-only rescan: the legacy simple classifier runs first and owns
    /// the category; the structured classifier refines confidence and
    /// summary, and supplies a filename only when the legacy pass did not.
    async fn rescan_llm_only(
        &self,
        doc: &SingleDocument,
        cancel: &CancelFlag,
    ) -> Result<SingleOutcome, PipelineError> {
        self.check_rescan_throttle(doc)?;
        self.store.touch_llm_rescan(doc.id)?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let text = doc.ocr_text.clone().unwrap_or_default();
        let filename_hint = doc
            .source_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let legacy = match self
            .classifier
            .classify_simple(&text, filename_hint.as_deref())
            .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!("legacy classifier failed for {}: {}", doc.id, e);
                None
            }
        };

        let structured = match self
            .classifier
            .classify_structured(
                &text,
                filename_hint.as_deref(),
                Some(doc.page_count),
                None,
            )
            .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!("structured classifier failed for {}: {}", doc.id, e);
                None
            }
        };

        let category = legacy
            .as_ref()
            .map(|l| l.category.clone())
            .or_else(|| structured.as_ref().map(|s| s.category.clone()));

        let ai = category.map(|category| {
            let category_changed = doc.ai_category.as_deref() != Some(category.as_str());
            let regenerate = category_changed || doc.ai_filename.is_none();
            let filename = if regenerate {
                legacy
                    .as_ref()
                    .and_then(|l| l.suggested_filename.clone())
                    .or_else(|| structured.as_ref().and_then(|s| s.suggested_filename.clone()))
            } else {
                doc.ai_filename.clone()
            };
            AiFields {
                category,
                filename,
                summary: structured.as_ref().map(|s| s.reasoning.clone()),
                confidence: structured.as_ref().map(|s| s.confidence).unwrap_or(0.5),
            }
        });

        if let Some(fields) = &ai {
            self.store.store_ai_result(
                doc.id,
                Some(&fields.category),
                fields.filename.as_deref(),
                fields.summary.as_deref(),
                Some(fields.confidence),
            )?;
        }

        Ok(SingleOutcome {
            cached: true,
            ocr_text: text,
            confidence: doc.ocr_confidence,
            rotation: doc.rotation,
            searchable_pdf: doc.searchable_pdf_path.clone().unwrap_or_default(),
            ai,
            page_errors: Vec::new(),
        })
    }

    fn check_rescan_throttle(&self, doc: &SingleDocument) -> Result<(), PipelineError> {
        if let Some(last) = doc.llm_rescanned_at {
            let elapsed = Utc::now().signed_duration_since(last);
            if elapsed < chrono::Duration::from_std(RESCAN_THROTTLE).unwrap_or_default() {
                return Err(PipelineError::Throttled);
            }
        }
        Ok(())
    }

    fn normalized_path_for(&self, doc: &SingleDocument) -> Result<PathBuf, PipelineError> {
        let kind = detect_artifact_kind(&doc.source_path);
        let outcome = self
            .normalizer
            .normalize(&doc.source_path, kind, &doc.source_hash)?;
        Ok(outcome.path)
    }

    /// OCR all pages and assemble the searchable PDF.
    async fn ocr_document(
        &self,
        doc: &SingleDocument,
        normalized: &Path,
        forced_rotation: Option<u16>,
        cancel: &CancelFlag,
    ) -> Result<(String, Option<f64>, Option<u16>, PathBuf, Vec<(u32, String)>), PipelineError>
    {
        let page_count = pdf::page_count(normalized)?.max(1);
        let scratch = TempDir::new()?;

        let mut page_specs = Vec::with_capacity(page_count as usize);
        let mut texts = Vec::with_capacity(page_count as usize);
        let mut confidences = Vec::new();
        let mut page_errors = Vec::new();
        let mut doc_rotation = None;

        for page_index in 0..page_count {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let override_angle = forced_rotation
                .or(self.store.get_rotation(&doc.source_hash, page_index)?);

            match self
                .ocr_page(normalized, page_index, override_angle, scratch.path(), cancel)
                .await
            {
                Ok(page) => {
                    if page_index == 0 {
                        doc_rotation = Some(page.angle);
                    }
                    let overlay =
                        pdf::truncate_utf8(&page.text, self.overlay_limit).to_string();
                    let dpi = (self.render_scale * 72.0).round().max(36.0) as u32;
                    page_specs.push(PageSpec::from_image_file(
                        &page.image,
                        dpi,
                        SEARCHABLE_JPEG_QUALITY,
                        Some(overlay),
                    )?);
                    if let Some(conf) = page.confidence {
                        confidences.push(conf);
                    }
                    texts.push(page.text);
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::warn!("document {} page {} failed: {}", doc.id, page_index + 1, e);
                    page_errors.push((page_index, e.to_string()));
                    texts.push(String::new());
                }
            }
        }

        if page_specs.is_empty() {
            let (_, error) = page_errors
                .last()
                .cloned()
                .unwrap_or((0, "no pages produced".to_string()));
            return Err(PipelineError::Ocr(OcrError::OcrFailed(error)));
        }

        let searchable = self.searchable_path(doc);
        if let Some(parent) = searchable.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = searchable.with_extension("pdf.tmp");
        pdf::write_image_pdf(&page_specs, &tmp)?;
        std::fs::rename(&tmp, &searchable)?;

        let text = texts.join("\n\n");
        let confidence = (!confidences.is_empty())
            .then(|| confidences.iter().sum::<f64>() / confidences.len() as f64);

        Ok((text, confidence, doc_rotation, searchable, page_errors))
    }

    /// OCR one page, honoring a rotation override or probing orientation.
    async fn ocr_page(
        &self,
        normalized: &Path,
        page_index: u32,
        override_angle: Option<u16>,
        scratch: &Path,
        cancel: &CancelFlag,
    ) -> Result<PageOcr, PipelineError> {
        let page_dir = scratch.join(format!("p{}", page_index));
        std::fs::create_dir_all(&page_dir)?;
        let image = self.render(normalized, page_index, &page_dir).await?;

        if let Some(angle) = override_angle {
            // Authoritative rotation: apply it, skip auto-detection
            rotation::rotate_image_file(&image, angle)?;
            let output = self.ocr_with_retry(&image, cancel).await?;
            return Ok(PageOcr {
                text: output.text,
                confidence: output.confidence,
                angle,
                image,
            });
        }

        self.probe_count.fetch_add(1, Ordering::Relaxed);
        let mut best: Option<(f64, u16, PathBuf, OcrOutput)> = None;
        for angle in [0u16, 90, 180, 270] {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let candidate = rotation::rotated_copy(&image, angle)?;
            let output = match self.ocr_with_retry(&candidate, cancel).await {
                Ok(o) => o,
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::debug!("probe at {}° failed: {}", angle, e);
                    continue;
                }
            };
            let score = orientation_score(&output);
            if best.as_ref().map(|(s, ..)| score > *s).unwrap_or(true) {
                best = Some((score, angle, candidate, output));
            }
        }

        let (_, angle, image, output) = best.ok_or_else(|| {
            PipelineError::Ocr(OcrError::OcrFailed("all orientations failed".to_string()))
        })?;
        Ok(PageOcr {
            text: output.text,
            confidence: output.confidence,
            angle,
            image,
        })
    }

    async fn render(
        &self,
        pdf_path: &Path,
        page_index: u32,
        out_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let engine = self.engine.clone();
        let pdf_path = pdf_path.to_path_buf();
        let out_dir = out_dir.to_path_buf();
        let scale = self.render_scale;
        let rendered = tokio::task::spawn_blocking(move || {
            engine.render_page(&pdf_path, page_index, scale, &out_dir)
        })
        .await
        .map_err(|e| PipelineError::Ocr(OcrError::RenderFailed(e.to_string())))??;
        Ok(rendered)
    }

    /// OCR with bounded retries (1 s, 4 s) and the per-page timeout.
    /// Missing tools are permanent; they fail immediately.
    async fn ocr_with_retry(
        &self,
        image: &Path,
        cancel: &CancelFlag,
    ) -> Result<OcrOutput, PipelineError> {
        let mut last_error = None;
        for attempt in 0..=OCR_RETRY_DELAYS.len() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(OCR_RETRY_DELAYS[attempt - 1])).await;
            }
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self.run_ocr(image).await {
                Ok(output) => return Ok(output),
                Err(e @ OcrError::ToolNotFound(_)) => return Err(e.into()),
                Err(e) => {
                    tracing::debug!("OCR attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| OcrError::OcrFailed("no attempt made".to_string()))
            .into())
    }

    async fn run_ocr(&self, image: &Path) -> Result<OcrOutput, OcrError> {
        self.ocr_count.fetch_add(1, Ordering::Relaxed);
        let engine = self.engine.clone();
        let image = image.to_path_buf();
        let timeout_secs = self.ocr_timeout.as_secs();
        let task = tokio::task::spawn_blocking(move || engine.ocr_image(&image));
        match tokio::time::timeout(self.ocr_timeout, task).await {
            Err(_) => Err(OcrError::Timeout(timeout_secs)),
            Ok(Err(join)) => Err(OcrError::OcrFailed(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    /// Classify a document, applying the filename regeneration policy:
    /// a new filename is produced when the category changed, the source
    /// changed, or no previous filename exists. Empty OCR text still
    /// classifies, which keeps deterministic-fallback runs stable.
    async fn classify(
        &self,
        doc: &SingleDocument,
        text: &str,
        source_changed: bool,
    ) -> Option<AiFields> {
        let filename_hint = doc
            .source_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        match self
            .classifier
            .classify_structured(text, filename_hint.as_deref(), Some(doc.page_count), None)
            .await
        {
            Ok(result) => {
                let category_changed =
                    doc.ai_category.as_deref() != Some(result.category.as_str());
                let regenerate =
                    category_changed || source_changed || doc.ai_filename.is_none();
                let filename = if regenerate {
                    result.suggested_filename
                } else {
                    doc.ai_filename.clone()
                };
                Some(AiFields {
                    category: result.category,
                    filename,
                    summary: Some(result.reasoning).filter(|r| !r.is_empty()),
                    confidence: result.confidence,
                })
            }
            Err(e) => {
                tracing::warn!("classification unavailable for {}: {}", doc.id, e);
                None
            }
        }
    }

    fn searchable_path(&self, doc: &SingleDocument) -> PathBuf {
        let stem = doc
            .source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document");
        self.processed_dir
            .join(&doc.source_hash[..2.min(doc.source_hash.len())])
            .join(format!(
                "searchable_{}-{}.pdf",
                stem,
                &doc.source_hash[..8.min(doc.source_hash.len())]
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{
        Classification, Classifier, FallbackClassifier, LlmError, SimpleClassification, TagSet,
        TypeAnalysis,
    };
    use crate::models::{ArtifactKind, BatchKind};
    use crate::ocr::StubEngine;
    use crate::repository::BatchRepository;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Fixture {
        pipeline: DocumentPipeline,
        stub: Arc<StubEngine>,
        store: DocumentRepository,
        batches: BatchRepository,
        _dir: tempfile::TempDir,
        dir: PathBuf,
    }

    fn fixture_with(classifier: Arc<dyn Classifier>) -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let db = root.join("test.db");
        let store = DocumentRepository::new(&db).unwrap();
        let batches = BatchRepository::new(&db).unwrap();
        let stub = Arc::new(StubEngine::new());

        let mut settings = Settings::with_data_dir(root.clone());
        settings.fast_test_mode = true;
        let pipeline = DocumentPipeline::new(
            &settings,
            store.clone(),
            stub.clone(),
            classifier,
            Normalizer::new(settings.normalized_cache_dir(), 150),
        );

        Fixture {
            pipeline,
            stub,
            store,
            batches,
            _dir: dir,
            dir: root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(FallbackClassifier::new()))
    }

    fn make_source_pdf(dir: &Path, name: &str) -> PathBuf {
        let image_path = dir.join("src_page.png");
        let img = image::ImageBuffer::from_pixel(24, 24, image::Rgb([255u8, 255, 255]));
        img.save(&image_path).unwrap();
        let pdf_path = dir.join(name);
        pdf::image_to_pdf(&image_path, &pdf_path, 150, 95).unwrap();
        pdf_path
    }

    fn make_doc(fx: &Fixture, pdf_path: &Path) -> SingleDocument {
        let hash = crate::utils::sha256_file(pdf_path).unwrap();
        let batch = fx
            .batches
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        fx.store
            .insert_or_get(batch.id, &hash, pdf_path, 1)
            .unwrap()
    }

    #[tokio::test]
    async fn test_unchanged_signature_skips_ocr() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "invoice.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();

        let first = fx
            .pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await
            .unwrap();
        assert!(!first.cached);
        let calls_after_first = fx.stub.ocr_calls();
        assert!(calls_after_first > 0);

        // Reload so the stored signature is visible, then run again
        let doc = fx.store.get(doc.id).unwrap().unwrap();
        let second = fx
            .pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(fx.stub.ocr_calls(), calls_after_first);
        assert_eq!(second.searchable_pdf, first.searchable_pdf);
        assert_eq!(second.ocr_text, first.ocr_text);
    }

    #[tokio::test]
    async fn test_modified_source_invalidates_cache() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "invoice.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();

        fx.pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await
            .unwrap();
        let calls_after_first = fx.stub.ocr_calls();

        // Grow the file; size change must invalidate the signature
        let mut bytes = std::fs::read(&pdf_path).unwrap();
        bytes.extend_from_slice(b"\n%appended");
        std::fs::write(&pdf_path, bytes).unwrap();

        let doc = fx.store.get(doc.id).unwrap().unwrap();
        let second = fx
            .pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await
            .unwrap();
        assert!(!second.cached);
        assert!(fx.stub.ocr_calls() > calls_after_first);

        let stored = fx.store.get(doc.id).unwrap().unwrap();
        assert_eq!(
            stored.signature,
            Some(OcrSignature::of_file(&pdf_path).unwrap())
        );
    }

    #[tokio::test]
    async fn test_rotation_override_skips_probe() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "scan.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();

        fx.store.set_rotation(&doc.source_hash, 0, 90).unwrap();
        let outcome = fx
            .pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await
            .unwrap();

        assert_eq!(fx.pipeline.probe_count(), 0);
        assert_eq!(outcome.rotation, Some(90));
        // Exactly one OCR call: the declared orientation only
        assert_eq!(fx.stub.ocr_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_override_probes_four_orientations() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "scan.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();

        let outcome = fx
            .pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await
            .unwrap();
        assert_eq!(fx.pipeline.probe_count(), 1);
        assert_eq!(fx.stub.ocr_calls(), 4);
        // Stub scores identically; the tie keeps the upright orientation
        assert_eq!(outcome.rotation, Some(0));
    }

    #[tokio::test]
    async fn test_cancelled_flag_stops_before_work() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "doc.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = fx
            .pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        // Nothing persisted for the untouched document
        let stored = fx.store.get(doc.id).unwrap().unwrap();
        assert!(stored.ocr_text.is_none());
    }

    #[tokio::test]
    async fn test_batch_scan_pages_resume_from_cache() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "stack.pdf");
        let hash = crate::utils::sha256_file(&pdf_path).unwrap();
        let cancel = CancelFlag::new();

        let first = fx
            .pipeline
            .process_batch_scan(&hash, &pdf_path, 1, &cancel)
            .await
            .unwrap();
        assert_eq!(first.pages_done, 1);
        assert_eq!(first.pages_cached, 0);

        let second = fx
            .pipeline
            .process_batch_scan(&hash, &pdf_path, 1, &cancel)
            .await
            .unwrap();
        assert_eq!(second.pages_done, 0);
        assert_eq!(second.pages_cached, 1);
    }

    /// Classifier that reports a fixed category/filename and records the
    /// order in which its entry points run.
    struct ScriptedClassifier {
        category: String,
        filename: Option<String>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedClassifier {
        fn new(category: &str, filename: Option<&str>) -> Self {
            Self {
                category: category.to_string(),
                filename: filename.map(str::to_string),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify_simple(
            &self,
            _text: &str,
            _filename: Option<&str>,
        ) -> Result<SimpleClassification, LlmError> {
            self.calls.lock().unwrap().push("legacy");
            Ok(SimpleClassification {
                category: self.category.clone(),
                suggested_filename: self.filename.clone(),
            })
        }

        async fn classify_structured(
            &self,
            _text: &str,
            _filename: Option<&str>,
            _page_count: Option<u32>,
            _size_mb: Option<f64>,
        ) -> Result<Classification, LlmError> {
            self.calls.lock().unwrap().push("structured");
            Ok(Classification {
                category: "StructuredCategory".to_string(),
                confidence: 0.9,
                reasoning: "structured reasoning".to_string(),
                suggested_filename: Some("structured_name".to_string()),
            })
        }

        async fn analyze_document_type(
            &self,
            _sample_texts: &[String],
            _filename: &str,
            _page_count: u32,
            _size_mb: f64,
        ) -> Result<TypeAnalysis, LlmError> {
            Err(LlmError::Api("not used".to_string()))
        }

        async fn extract_tags(&self, _text: &str) -> Result<TagSet, LlmError> {
            Ok(TagSet::default())
        }
    }

    #[tokio::test]
    async fn test_llm_only_rescan_runs_legacy_first_and_wins() {
        let classifier = Arc::new(ScriptedClassifier::new(
            "LegacyCategory",
            Some("legacy_name"),
        ));
        let fx = fixture_with(classifier.clone());
        let pdf_path = make_source_pdf(&fx.dir, "letter.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();

        let outcome = fx
            .pipeline
            .rescan(doc.id, RescanMode::LlmOnly, &cancel)
            .await
            .unwrap();

        let calls = classifier.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["legacy", "structured"]);

        let ai = outcome.ai.unwrap();
        // The legacy override decides category and filename; structured
        // output only refines confidence and summary
        assert_eq!(ai.category, "LegacyCategory");
        assert_eq!(ai.filename.as_deref(), Some("legacy_name"));
        assert!((ai.confidence - 0.9).abs() < f64::EPSILON);

        let stored = fx.store.get(doc.id).unwrap().unwrap();
        assert_eq!(stored.ai_category.as_deref(), Some("LegacyCategory"));
        assert_eq!(stored.ai_filename.as_deref(), Some("legacy_name"));
    }

    #[tokio::test]
    async fn test_llm_rescan_is_throttled() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "letter.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();

        fx.pipeline
            .rescan(doc.id, RescanMode::LlmOnly, &cancel)
            .await
            .unwrap();
        let second = fx.pipeline.rescan(doc.id, RescanMode::LlmOnly, &cancel).await;
        assert!(matches!(second, Err(PipelineError::Throttled)));
    }

    #[tokio::test]
    async fn test_filename_kept_when_category_and_source_unchanged() {
        let fx = fixture();
        let pdf_path = make_source_pdf(&fx.dir, "invoice.pdf");
        let doc = make_doc(&fx, &pdf_path);
        let cancel = CancelFlag::new();

        fx.pipeline
            .process_single(&doc, &pdf_path, None, &cancel)
            .await
            .unwrap();
        let after_first = fx.store.get(doc.id).unwrap().unwrap();
        let original_filename = after_first.ai_filename.clone();
        assert!(original_filename.is_some());

        // Same source, same category: cached OCR, no filename regeneration
        let outcome = fx
            .pipeline
            .process_single(&after_first, &pdf_path, None, &cancel)
            .await
            .unwrap();
        assert!(outcome.cached);
        let after_second = fx.store.get(doc.id).unwrap().unwrap();
        assert_eq!(after_second.ai_filename, original_filename);
    }
}
