//! Domain models for batches, documents, and intake analysis.

mod analysis;
mod batch;
mod document;
mod signature;

pub use analysis::{Analysis, ArtifactKind, ProcessingStrategy};
pub use batch::{Batch, BatchKind, BatchStatus};
pub use document::{
    DocumentState, GroupedDocument, GroupedPage, RescanMode, SingleDocument,
};
pub use signature::OcrSignature;
