//! Intake analysis records produced by the detector.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of a user-supplied artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Pdf,
    Image,
    Unknown,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Unknown => "unknown",
        }
    }
}

/// Tentative processing strategy for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    SingleDocument,
    BatchScan,
}

impl ProcessingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleDocument => "single_document",
            Self::BatchScan => "batch_scan",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single_document" => Some(Self::SingleDocument),
            "batch_scan" => Some(Self::BatchScan),
            _ => None,
        }
    }
}

/// Everything the detector learned about one intake file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Absolute path of the original artifact. Never mutated.
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// SHA-256 of the artifact content.
    pub content_hash: String,
    pub page_count: u32,
    pub size_mb: f64,
    /// Canonical PDF for this artifact (the file itself for PDFs).
    pub normalized_path: PathBuf,
    /// True when the normalized cache already held this content hash.
    pub reused: bool,
    pub strategy: ProcessingStrategy,
    /// Combined heuristic + LLM confidence in [0, 1].
    pub confidence: f64,
    /// Human-readable scoring trail, one entry per signal.
    pub reasoning: Vec<String>,
    /// Raw reasoning from the LLM classifier when it was consulted.
    pub llm_annotation: Option<String>,
}
