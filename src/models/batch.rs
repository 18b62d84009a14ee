//! Batch model: a unit of user work grouping artifacts of one processing kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a batch holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    SingleDocumentBatch,
    GroupedBatch,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleDocumentBatch => "single_document_batch",
            Self::GroupedBatch => "grouped_batch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single_document_batch" => Some(Self::SingleDocumentBatch),
            "grouped_batch" => Some(Self::GroupedBatch),
            _ => None,
        }
    }
}

/// Batch lifecycle status.
///
/// Transitions are monotonic along this lattice; the only way back is an
/// explicit admin reset through `BatchStatus::is_admin_reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    PendingProcessing,
    PendingVerification,
    PendingGrouping,
    PendingOrdering,
    PendingExport,
    Exported,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingProcessing => "pending_processing",
            Self::PendingVerification => "pending_verification",
            Self::PendingGrouping => "pending_grouping",
            Self::PendingOrdering => "pending_ordering",
            Self::PendingExport => "pending_export",
            Self::Exported => "exported",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_processing" => Some(Self::PendingProcessing),
            "pending_verification" => Some(Self::PendingVerification),
            "pending_grouping" => Some(Self::PendingGrouping),
            "pending_ordering" => Some(Self::PendingOrdering),
            "pending_export" => Some(Self::PendingExport),
            "exported" => Some(Self::Exported),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Position in the status lattice, used for the monotonicity check.
    fn rank(&self) -> u8 {
        match self {
            Self::PendingProcessing => 0,
            Self::PendingVerification => 1,
            Self::PendingGrouping => 2,
            Self::PendingOrdering => 3,
            Self::PendingExport => 4,
            Self::Exported => 5,
            Self::Failed => 6,
        }
    }

    /// Whether a batch in this status can still receive intake artifacts.
    pub fn is_reusable_for_intake(&self) -> bool {
        self.rank() < Self::PendingExport.rank()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exported | Self::Failed)
    }

    /// A forward move along the lattice. `Failed` is reachable from anywhere.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        next == Self::Failed || next.rank() > self.rank()
    }

    /// Admin reset: back to the head of the lattice.
    pub fn is_admin_reset(next: BatchStatus) -> bool {
        next == Self::PendingProcessing
    }
}

/// A unit of user work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub kind: BatchKind,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
