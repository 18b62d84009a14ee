//! Export assembler: verified batches become categorized PDFs in the
//! filing cabinet.
//!
//! Naming is deterministic and collision-safe, every copy is verified by
//! size and hash, and a per-document failure rolls back everything this
//! run wrote while the batch keeps its prior status. Re-running an export
//! is idempotent: byte-identical targets are left alone, missing ones are
//! written, differing content gets the next collision suffix.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use thiserror::Error;

use crate::config::Settings;
use crate::intake::Normalizer;
use crate::llm::Classifier;
use crate::models::{Batch, BatchKind, BatchStatus, DocumentState, GroupedDocument, SingleDocument};
use crate::ocr::{OcrEngine, OcrError};
use crate::pdf::{self, PageSpec, PdfError};
use crate::pipeline::rotate_image_file;
use crate::repository::{
    interaction::events as log_events, BatchRepository, DocumentRepository, InteractionLog,
    RepositoryError,
};
use crate::utils::sha256_file;

/// JPEG quality for grouped-document page rasters.
const EXPORT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Document not ready: {0}")]
    Incomplete(String),

    #[error("Verification failed: {0}")]
    Verify(String),

    #[error("Store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("PDF error: {0}")]
    Pdf(#[from] PdfError),

    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What one export run did.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub batch_id: i64,
    pub written: Vec<PathBuf>,
    /// Targets that already existed with identical content.
    pub skipped: usize,
    pub tags_extracted: usize,
    pub warnings: Vec<String>,
}

/// Sanitize a category into a directory name: spaces become underscores,
/// then only `[A-Za-z0-9_-]` survives.
pub fn sanitize_category_dir(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if sanitized.is_empty() {
        "Uncategorized".to_string()
    } else {
        sanitized
    }
}

/// Sanitize a filename stem: every character outside `[A-Za-z0-9_.-]`
/// becomes `_`. Applying it twice equals applying it once.
pub fn sanitize_export_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.chars().all(|c| c == '_' || c == '.') {
        "document".to_string()
    } else {
        sanitized
    }
}

enum Target {
    /// Write to this fresh path.
    Write(PathBuf),
    /// Identical content already present; nothing to do.
    Present(PathBuf),
}

pub struct Exporter {
    batches: BatchRepository,
    docs: DocumentRepository,
    log: InteractionLog,
    classifier: Arc<dyn Classifier>,
    engine: Arc<dyn OcrEngine>,
    normalizer: Normalizer,
    cabinet: PathBuf,
    render_scale: f32,
    enable_tags: bool,
}

impl Exporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        batches: BatchRepository,
        docs: DocumentRepository,
        log: InteractionLog,
        classifier: Arc<dyn Classifier>,
        engine: Arc<dyn OcrEngine>,
        normalizer: Normalizer,
    ) -> Self {
        Self {
            batches,
            docs,
            log,
            classifier,
            engine,
            normalizer,
            cabinet: settings.filing_cabinet_dir(),
            render_scale: settings.ocr_render_scale,
            enable_tags: settings.enable_tag_extraction,
        }
    }

    /// Export every document of a batch into the filing cabinet.
    pub async fn export_batch(&self, batch_id: i64) -> Result<ExportReport, ExportError> {
        let batch = self
            .batches
            .get(batch_id)?
            .ok_or_else(|| ExportError::NotFound(format!("batch {}", batch_id)))?;

        if batch.status == BatchStatus::Failed {
            return Err(ExportError::Incomplete(format!(
                "batch {} is failed; reset it first",
                batch_id
            )));
        }

        let mut report = ExportReport {
            batch_id,
            ..ExportReport::default()
        };

        let result = match batch.kind {
            BatchKind::SingleDocumentBatch => {
                self.export_single_batch(&batch, &mut report).await
            }
            BatchKind::GroupedBatch => self.export_grouped_batch(&batch, &mut report).await,
        };

        if let Err(e) = result {
            // Per-document failure: remove everything this run wrote; the
            // batch keeps its prior status.
            for path in &report.written {
                let _ = std::fs::remove_file(path);
            }
            self.log.append(
                log_events::EXPORT_FAILED,
                Some(batch_id),
                None,
                &e.to_string(),
            );
            return Err(e);
        }

        if batch.status != BatchStatus::Exported {
            if let Err(e) = self.batches.transition(batch_id, BatchStatus::Exported) {
                tracing::warn!("batch {} export transition failed: {}", batch_id, e);
            }
        }
        self.log.append(
            log_events::EXPORT_SUCCEEDED,
            Some(batch_id),
            None,
            &format!(
                "{} written, {} already present",
                report.written.len(),
                report.skipped
            ),
        );
        Ok(report)
    }

    async fn export_single_batch(
        &self,
        batch: &Batch,
        report: &mut ExportReport,
    ) -> Result<(), ExportError> {
        let docs = self.docs.list_by_batch(batch.id)?;
        if docs.is_empty() {
            return Err(ExportError::Incomplete(format!(
                "batch {} has no documents",
                batch.id
            )));
        }

        for doc in &docs {
            self.export_single_document(doc, report)?;
        }
        // State flips only once the whole batch made it out; a rollback
        // must leave every document as it was
        for doc in &docs {
            self.docs.set_state(doc.id, DocumentState::Exported)?;
        }

        if self.enable_tags {
            for doc in &docs {
                self.extract_tags_for(doc, report).await;
            }
        }
        Ok(())
    }

    fn export_single_document(
        &self,
        doc: &SingleDocument,
        report: &mut ExportReport,
    ) -> Result<(), ExportError> {
        let category = doc.export_category().ok_or_else(|| {
            ExportError::Incomplete(format!("document {} has no category", doc.id))
        })?;
        let filename = doc.export_filename().ok_or_else(|| {
            ExportError::Incomplete(format!("document {} has no filename", doc.id))
        })?;
        let source = doc.searchable_pdf_path.as_ref().ok_or_else(|| {
            ExportError::Incomplete(format!("document {} has no searchable PDF", doc.id))
        })?;
        if !source.exists() {
            return Err(ExportError::Incomplete(format!(
                "document {}: searchable PDF missing on disk",
                doc.id
            )));
        }

        let source_hash = sha256_file(source)?;
        match self.resolve_target(category, filename, &source_hash)? {
            Target::Present(path) => {
                tracing::debug!("document {} already exported at {}", doc.id, path.display());
                report.skipped += 1;
            }
            Target::Write(path) => {
                std::fs::copy(source, &path)?;
                self.verify_copy(source, &path, &source_hash)?;
                report.written.push(path);
            }
        }
        Ok(())
    }

    async fn export_grouped_batch(
        &self,
        batch: &Batch,
        report: &mut ExportReport,
    ) -> Result<(), ExportError> {
        let docs = self.docs.list_grouped_by_batch(batch.id)?;
        if docs.is_empty() {
            return Err(ExportError::Incomplete(format!(
                "batch {} has no grouped documents",
                batch.id
            )));
        }

        for doc in &docs {
            self.export_grouped_document(doc, report)?;
        }
        for doc in &docs {
            self.docs.set_grouped_state(doc.id, DocumentState::Exported)?;
        }

        if self.enable_tags {
            for doc in &docs {
                let text: String = doc
                    .pages
                    .iter()
                    .filter_map(|p| p.ocr_text.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                self.extract_tags_for_text(&doc.name, batch.id, &text, report)
                    .await;
            }
        }
        Ok(())
    }

    /// Concatenate the rotated pages of a grouped document into a fresh
    /// PDF, honoring per-page rotation overrides.
    fn export_grouped_document(
        &self,
        doc: &GroupedDocument,
        report: &mut ExportReport,
    ) -> Result<(), ExportError> {
        let category = doc.final_category.as_deref().ok_or_else(|| {
            ExportError::Incomplete(format!("grouped document '{}' has no category", doc.name))
        })?;
        if doc.pages.is_empty() {
            return Err(ExportError::Incomplete(format!(
                "grouped document '{}' has no pages",
                doc.name
            )));
        }

        let scratch = TempDir::new()?;
        let mut specs = Vec::with_capacity(doc.pages.len());
        for page in &doc.pages {
            let artifact = self.normalizer.cached_path(&page.artifact_hash);
            if !artifact.exists() {
                return Err(ExportError::Incomplete(format!(
                    "artifact {} no longer in the normalized cache; re-run intake",
                    page.artifact_hash
                )));
            }

            let page_dir = scratch.path().join(format!("pg{}", page.id));
            std::fs::create_dir_all(&page_dir)?;
            let image =
                self.engine
                    .render_page(&artifact, page.page_index, self.render_scale, &page_dir)?;

            let angle = match page.rotation {
                Some(angle) => Some(angle),
                None => self.docs.get_rotation(&page.artifact_hash, page.page_index)?,
            };
            if let Some(angle) = angle {
                rotate_image_file(&image, angle)?;
            }

            let dpi = (self.render_scale * 72.0).round().max(36.0) as u32;
            specs.push(PageSpec::from_image_file(
                &image,
                dpi,
                EXPORT_JPEG_QUALITY,
                page.ocr_text.clone(),
            )?);
        }

        let assembled = scratch.path().join("assembled.pdf");
        pdf::write_image_pdf(&specs, &assembled)?;
        let assembled_hash = sha256_file(&assembled)?;

        match self.resolve_target(category, &doc.name, &assembled_hash)? {
            Target::Present(path) => {
                tracing::debug!(
                    "grouped document '{}' already exported at {}",
                    doc.name,
                    path.display()
                );
                report.skipped += 1;
            }
            Target::Write(path) => {
                std::fs::copy(&assembled, &path)?;
                self.verify_copy(&assembled, &path, &assembled_hash)?;
                report.written.push(path);
            }
        }
        Ok(())
    }

    /// Pick the destination inside the category directory: first free
    /// collision suffix wins, unless an identical copy already sits at one
    /// of the candidates.
    fn resolve_target(
        &self,
        category: &str,
        filename: &str,
        source_hash: &str,
    ) -> Result<Target, ExportError> {
        let dir = self.cabinet.join(sanitize_category_dir(category));
        std::fs::create_dir_all(&dir)?;
        let stem = sanitize_export_filename(filename);

        for suffix in 0u32.. {
            let candidate = if suffix == 0 {
                dir.join(format!("{}.pdf", stem))
            } else {
                dir.join(format!("{}_{}.pdf", stem, suffix))
            };
            if !candidate.exists() {
                return Ok(Target::Write(candidate));
            }
            if sha256_file(&candidate)? == source_hash {
                return Ok(Target::Present(candidate));
            }
        }
        unreachable!("suffix search is unbounded")
    }

    /// A copy counts only if the destination matches the source by size
    /// and hash.
    fn verify_copy(&self, source: &Path, dest: &Path, source_hash: &str) -> Result<(), ExportError> {
        let src_len = std::fs::metadata(source)?.len();
        let dst_len = std::fs::metadata(dest)?.len();
        if src_len != dst_len {
            return Err(ExportError::Verify(format!(
                "{}: size mismatch ({} vs {})",
                dest.display(),
                src_len,
                dst_len
            )));
        }
        let dst_hash = sha256_file(dest)?;
        if dst_hash != source_hash {
            return Err(ExportError::Verify(format!(
                "{}: hash mismatch",
                dest.display()
            )));
        }
        Ok(())
    }

    async fn extract_tags_for(&self, doc: &SingleDocument, report: &mut ExportReport) {
        let Some(text) = doc.ocr_text.as_deref().filter(|t| !t.is_empty()) else {
            return;
        };
        match self.classifier.extract_tags(text).await {
            Ok(tags) => {
                let detail = serde_json::to_string(&tags).unwrap_or_default();
                self.log.append(
                    log_events::TAGS_EXTRACTED,
                    Some(doc.batch_id),
                    Some(doc.id),
                    &detail,
                );
                report.tags_extracted += 1;
            }
            Err(e) => {
                tracing::warn!("tag extraction failed for document {}: {}", doc.id, e);
                report
                    .warnings
                    .push(format!("tags for document {}: {}", doc.id, e));
            }
        }
    }

    async fn extract_tags_for_text(
        &self,
        name: &str,
        batch_id: i64,
        text: &str,
        report: &mut ExportReport,
    ) {
        if text.is_empty() {
            return;
        }
        match self.classifier.extract_tags(text).await {
            Ok(tags) => {
                let detail = serde_json::to_string(&tags).unwrap_or_default();
                self.log
                    .append(log_events::TAGS_EXTRACTED, Some(batch_id), None, &detail);
                report.tags_extracted += 1;
            }
            Err(e) => {
                tracing::warn!("tag extraction failed for '{}': {}", name, e);
                report.warnings.push(format!("tags for '{}': {}", name, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_dir_sanitization() {
        assert_eq!(sanitize_category_dir("Tax Documents"), "Tax_Documents");
        assert_eq!(sanitize_category_dir("A/B (2024)!"), "AB_2024");
        assert_eq!(sanitize_category_dir("///"), "Uncategorized");
    }

    #[test]
    fn test_filename_sanitization_is_a_projection() {
        let cases = [
            "2024 Invoice: Acme?",
            "plain_name",
            "weird\\/chars<>|now",
            "über straße",
        ];
        for case in cases {
            let once = sanitize_export_filename(case);
            let twice = sanitize_export_filename(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", case);
            assert!(once
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
        }
    }

    #[test]
    fn test_filename_sanitization_never_empty() {
        assert_eq!(sanitize_export_filename("???"), "document");
        assert_eq!(sanitize_export_filename(""), "document");
    }
}
