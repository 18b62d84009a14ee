//! Logical output documents: single documents and grouped page carvings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::OcrSignature;

/// Per-document processing state.
///
/// Grouping and ordering states apply only to grouped batches. A document
/// may move back from `AiDone` to `OcrDone` through an explicit rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    New,
    OcrDone,
    AiDone,
    Verified,
    Grouped,
    Ordered,
    Exported,
    Failed,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::OcrDone => "ocr_done",
            Self::AiDone => "ai_done",
            Self::Verified => "verified",
            Self::Grouped => "grouped",
            Self::Ordered => "ordered",
            Self::Exported => "exported",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "ocr_done" => Some(Self::OcrDone),
            "ai_done" => Some(Self::AiDone),
            "verified" => Some(Self::Verified),
            "grouped" => Some(Self::Grouped),
            "ordered" => Some(Self::Ordered),
            "exported" => Some(Self::Exported),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Rescan modes for a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescanMode {
    /// Redo OCR only; keep AI fields.
    Ocr,
    /// Reuse stored OCR text, reclassify.
    LlmOnly,
    /// Full redo.
    OcrAndLlm,
}

impl RescanMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ocr" => Some(Self::Ocr),
            "llm_only" => Some(Self::LlmOnly),
            "ocr_and_llm" => Some(Self::OcrAndLlm),
            _ => None,
        }
    }
}

/// A 1-to-1 logical document backed by one intake artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleDocument {
    pub id: i64,
    pub batch_id: i64,
    /// SHA-256 of the source artifact.
    pub source_hash: String,
    /// Original artifact path (reference only; the file is never mutated).
    pub source_path: PathBuf,
    pub page_count: u32,
    pub ocr_text: Option<String>,
    pub ocr_confidence: Option<f64>,
    /// Invalidation key for the cached OCR output below.
    pub signature: Option<OcrSignature>,
    /// Applied rotation in degrees, when one was forced or detected.
    pub rotation: Option<u16>,
    pub searchable_pdf_path: Option<PathBuf>,
    pub ai_category: Option<String>,
    pub ai_filename: Option<String>,
    pub ai_summary: Option<String>,
    pub ai_confidence: Option<f64>,
    pub final_category: Option<String>,
    pub final_filename: Option<String>,
    pub state: DocumentState,
    pub error: Option<String>,
    /// Throttle stamp for LLM rescans.
    pub llm_rescanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SingleDocument {
    /// Effective category for export: user verification wins over the AI.
    pub fn export_category(&self) -> Option<&str> {
        self.final_category
            .as_deref()
            .or(self.ai_category.as_deref())
    }

    /// Effective filename stem for export.
    pub fn export_filename(&self) -> Option<&str> {
        self.final_filename
            .as_deref()
            .or(self.ai_filename.as_deref())
    }
}

/// An ordered, named sequence of pages carved out of a batch-scan artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedDocument {
    pub id: i64,
    pub batch_id: i64,
    pub name: String,
    pub final_category: Option<String>,
    /// Position of this document within the batch.
    pub position: u32,
    pub state: DocumentState,
    pub pages: Vec<GroupedPage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of a grouped document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedPage {
    pub id: i64,
    pub document_id: i64,
    /// SHA-256 of the artifact the page comes from.
    pub artifact_hash: String,
    /// Zero-based page index within the artifact.
    pub page_index: u32,
    pub category: Option<String>,
    /// Per-page rotation override in degrees.
    pub rotation: Option<u16>,
    pub ocr_text: Option<String>,
    /// Position of this page within the document.
    pub position: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            DocumentState::New,
            DocumentState::OcrDone,
            DocumentState::AiDone,
            DocumentState::Verified,
            DocumentState::Grouped,
            DocumentState::Ordered,
            DocumentState::Exported,
            DocumentState::Failed,
        ] {
            assert_eq!(DocumentState::from_str(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_export_fields_prefer_final_values() {
        let mut doc = SingleDocument {
            id: 1,
            batch_id: 1,
            source_hash: "ab".into(),
            source_path: PathBuf::from("/intake/a.pdf"),
            page_count: 1,
            ocr_text: None,
            ocr_confidence: None,
            signature: None,
            rotation: None,
            searchable_pdf_path: None,
            ai_category: Some("Invoice".into()),
            ai_filename: Some("2024_Invoice".into()),
            ai_summary: None,
            ai_confidence: None,
            final_category: None,
            final_filename: None,
            state: DocumentState::AiDone,
            error: None,
            llm_rescanned_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(doc.export_category(), Some("Invoice"));
        doc.final_category = Some("Receipts".into());
        assert_eq!(doc.export_category(), Some("Receipts"));
        assert_eq!(doc.export_filename(), Some("2024_Invoice"));
    }
}
