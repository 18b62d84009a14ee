//! Progress events streamed to clients during a smart-processing run.

use serde::{Deserialize, Serialize};

/// Pipeline stage a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyze,
    Normalize,
    Ocr,
    AiClassify,
    Persist,
    Finalize,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Normalize => "normalize",
            Self::Ocr => "ocr",
            Self::AiClassify => "ai_classify",
            Self::Persist => "persist",
            Self::Finalize => "finalize",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One in-flight progress update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub token: String,
    pub phase: Phase,
    pub current: u64,
    pub total: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The closing event of a stream: final batch ids, counts, and aggregate
/// errors. After this the stream ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub token: String,
    pub phase: Phase,
    pub terminal: bool,
    pub current: u64,
    pub total: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_batch_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouped_batch_id: Option<i64>,
    pub processed: u64,
    pub failed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Everything a progress stream can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Progress(PhaseEvent),
    Terminal(TerminalEvent),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Progress(e) => e.phase,
            Self::Terminal(e) => e.phase,
        }
    }
}
