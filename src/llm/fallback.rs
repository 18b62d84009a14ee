//! Deterministic classifier for fast test mode.
//!
//! Produces stable categories and filenames from the input alone so the
//! pipeline, export naming, and rescan flows can be exercised without a
//! running LLM service.

use async_trait::async_trait;

use crate::models::ProcessingStrategy;
use crate::utils::sha256_bytes;

use super::{Classification, Classifier, LlmError, SimpleClassification, TagSet, TypeAnalysis};

const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("invoice", "Invoice"),
    ("receipt", "Receipt"),
    ("statement", "Statement"),
    ("contract", "Contract"),
    ("letter", "Letter"),
    ("tax", "Tax"),
    ("medical", "Medical"),
];

pub struct FallbackClassifier;

impl FallbackClassifier {
    pub fn new() -> Self {
        Self
    }

    fn category_for(text: &str, filename: Option<&str>) -> String {
        let haystack = format!("{} {}", filename.unwrap_or(""), text).to_lowercase();
        for (keyword, category) in CATEGORY_KEYWORDS {
            if haystack.contains(keyword) {
                return (*category).to_string();
            }
        }
        "Unfiled".to_string()
    }

    fn filename_for(category: &str, text: &str, filename: Option<&str>) -> String {
        let stem = filename
            .and_then(|f| f.rsplit('/').next())
            .and_then(|f| f.split('.').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("document");
        let digest = sha256_bytes(format!("{}:{}", stem, text).as_bytes());
        format!("{}_{}_{}", category, stem, &digest[..8])
    }
}

impl Default for FallbackClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Classifier for FallbackClassifier {
    async fn classify_simple(
        &self,
        text: &str,
        filename: Option<&str>,
    ) -> Result<SimpleClassification, LlmError> {
        let category = Self::category_for(text, filename);
        let suggested = Self::filename_for(&category, text, filename);
        Ok(SimpleClassification {
            category,
            suggested_filename: Some(suggested),
        })
    }

    async fn classify_structured(
        &self,
        text: &str,
        filename: Option<&str>,
        _page_count: Option<u32>,
        _size_mb: Option<f64>,
    ) -> Result<Classification, LlmError> {
        let category = Self::category_for(text, filename);
        let suggested = Self::filename_for(&category, text, filename);
        Ok(Classification {
            category,
            confidence: 0.75,
            reasoning: "deterministic fallback".to_string(),
            suggested_filename: Some(suggested),
        })
    }

    async fn analyze_document_type(
        &self,
        _sample_texts: &[String],
        _filename: &str,
        page_count: u32,
        _size_mb: f64,
    ) -> Result<TypeAnalysis, LlmError> {
        let classification = if page_count >= 5 {
            ProcessingStrategy::BatchScan
        } else {
            ProcessingStrategy::SingleDocument
        };
        Ok(TypeAnalysis {
            classification,
            confidence: 80.0,
            reasoning: "deterministic fallback by page count".to_string(),
        })
    }

    async fn extract_tags(&self, text: &str) -> Result<TagSet, LlmError> {
        let keywords = text
            .split_whitespace()
            .filter(|w| w.len() > 6)
            .take(5)
            .map(|w| w.to_lowercase())
            .collect();
        Ok(TagSet {
            keywords,
            ..TagSet::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_is_deterministic() {
        let classifier = FallbackClassifier::new();
        let a = classifier
            .classify_simple("Invoice from Acme", Some("invoice.pdf"))
            .await
            .unwrap();
        let b = classifier
            .classify_simple("Invoice from Acme", Some("invoice.pdf"))
            .await
            .unwrap();
        assert_eq!(a.category, "Invoice");
        assert_eq!(a.suggested_filename, b.suggested_filename);
    }

    #[tokio::test]
    async fn test_fallback_type_analysis_by_pages() {
        let classifier = FallbackClassifier::new();
        let small = classifier
            .analyze_document_type(&[], "a.pdf", 2, 0.1)
            .await
            .unwrap();
        assert_eq!(small.classification, ProcessingStrategy::SingleDocument);
        let big = classifier
            .analyze_document_type(&[], "a.pdf", 9, 0.9)
            .await
            .unwrap();
        assert_eq!(big.classification, ProcessingStrategy::BatchScan);
    }
}
