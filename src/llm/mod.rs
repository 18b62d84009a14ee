//! LLM-backed classification.
//!
//! The local LLM service is a collaborator behind the `Classifier` trait:
//! category classification, document-type analysis for the intake detector,
//! and optional tag extraction. Every operation degrades gracefully — a
//! `None`/error result means the caller proceeds without AI fields.

mod fallback;
mod ollama;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::models::ProcessingStrategy;

pub use fallback::FallbackClassifier;
pub use ollama::OllamaClient;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Request timed out")]
    Timeout,
}

/// Result of the legacy one-shot classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleClassification {
    pub category: String,
    pub suggested_filename: Option<String>,
}

/// Result of the structured classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    /// In [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    pub suggested_filename: Option<String>,
}

/// Result of single-document vs batch-scan analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeAnalysis {
    pub classification: ProcessingStrategy,
    /// In [0, 100].
    pub confidence: f64,
    pub reasoning: String,
}

/// Structured tags extracted after export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagSet {
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub places: Vec<String>,
    #[serde(default)]
    pub dates: Vec<String>,
    #[serde(default)]
    pub document_types: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub amounts: Vec<String>,
    #[serde(default)]
    pub reference_numbers: Vec<String>,
}

/// The classification operations the pipeline consumes.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Legacy simple classifier: category plus an optional filename, no
    /// confidence. Runs first on `llm_only` rescans.
    async fn classify_simple(
        &self,
        text: &str,
        filename: Option<&str>,
    ) -> Result<SimpleClassification, LlmError>;

    /// Structured classifier with confidence and reasoning.
    async fn classify_structured(
        &self,
        text: &str,
        filename: Option<&str>,
        page_count: Option<u32>,
        size_mb: Option<f64>,
    ) -> Result<Classification, LlmError>;

    /// Decide whether sampled pages look like one document or a batch scan.
    async fn analyze_document_type(
        &self,
        sample_texts: &[String],
        filename: &str,
        page_count: u32,
        size_mb: f64,
    ) -> Result<TypeAnalysis, LlmError>;

    /// Extract structured tags from document text.
    async fn extract_tags(&self, text: &str) -> Result<TagSet, LlmError>;
}

/// Caps concurrent requests against a single LLM host. A local Ollama
/// instance degrades badly past one or two in-flight generations.
pub struct LimitedClassifier {
    inner: Arc<dyn Classifier>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl LimitedClassifier {
    pub fn new(inner: Arc<dyn Classifier>, concurrency: usize) -> Self {
        Self {
            inner,
            semaphore: Arc::new(tokio::sync::Semaphore::new(concurrency.max(1))),
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, LlmError> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Connection("limiter closed".to_string()))
    }
}

#[async_trait]
impl Classifier for LimitedClassifier {
    async fn classify_simple(
        &self,
        text: &str,
        filename: Option<&str>,
    ) -> Result<SimpleClassification, LlmError> {
        let _permit = self.permit().await?;
        self.inner.classify_simple(text, filename).await
    }

    async fn classify_structured(
        &self,
        text: &str,
        filename: Option<&str>,
        page_count: Option<u32>,
        size_mb: Option<f64>,
    ) -> Result<Classification, LlmError> {
        let _permit = self.permit().await?;
        self.inner
            .classify_structured(text, filename, page_count, size_mb)
            .await
    }

    async fn analyze_document_type(
        &self,
        sample_texts: &[String],
        filename: &str,
        page_count: u32,
        size_mb: f64,
    ) -> Result<TypeAnalysis, LlmError> {
        let _permit = self.permit().await?;
        self.inner
            .analyze_document_type(sample_texts, filename, page_count, size_mb)
            .await
    }

    async fn extract_tags(&self, text: &str) -> Result<TagSet, LlmError> {
        let _permit = self.permit().await?;
        self.inner.extract_tags(text).await
    }
}

/// Select the classifier for the current configuration, capped at the
/// configured host concurrency.
pub fn classifier_for(settings: &Settings) -> Arc<dyn Classifier> {
    let base: Arc<dyn Classifier> = if settings.fast_test_mode {
        Arc::new(FallbackClassifier::new())
    } else {
        Arc::new(OllamaClient::new(settings))
    };
    Arc::new(LimitedClassifier::new(base, settings.llm_concurrency))
}
