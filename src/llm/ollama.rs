//! Ollama API client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Settings;
use crate::models::ProcessingStrategy;

use super::{Classification, Classifier, LlmError, SimpleClassification, TagSet, TypeAnalysis};

/// Maximum document text sent with a single prompt.
const MAX_CONTENT_CHARS: usize = 8000;

/// Retries after the initial attempt.
const MAX_RETRIES: usize = 2;

pub struct OllamaClient {
    endpoint: String,
    model: String,
    ctx_classify: Option<u32>,
    ctx_detect: Option<u32>,
    ctx_tags: Option<u32>,
    client: Client,
}

/// Ollama API request format.
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

/// Ollama API response format.
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(settings: &Settings) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(settings.ollama_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            endpoint: settings.ollama_host.trim_end_matches('/').to_string(),
            model: settings.ollama_model.clone(),
            ctx_classify: settings.ollama_ctx_classify,
            ctx_detect: settings.ollama_ctx_detect,
            ctx_tags: settings.ollama_ctx_tags,
            client,
        }
    }

    /// Check if the LLM service is available.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Call the generate endpoint, retrying transient failures.
    async fn generate(&self, prompt: &str, num_ctx: Option<u32>) -> Result<String, LlmError> {
        let mut last_err = LlmError::Connection("no attempt made".to_string());
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(500 * attempt as u64)).await;
            }
            match self.generate_once(prompt, num_ctx).await {
                Ok(text) => return Ok(text),
                Err(e @ LlmError::Parse(_)) => return Err(e),
                Err(e) => {
                    debug!("LLM attempt {} failed: {}", attempt + 1, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn generate_once(&self, prompt: &str, num_ctx: Option<u32>) -> Result<String, LlmError> {
        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: 0.1,
                num_ctx,
            },
        };

        let url = format!("{}/api/generate", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, body)));
        }

        // Prefer the typed body; fall back to raw text when a proxy or an
        // older server returns something that isn't the documented shape.
        let body = resp
            .text()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        match serde_json::from_str::<OllamaResponse>(&body) {
            Ok(parsed) => Ok(parsed.response),
            Err(_) => Ok(body),
        }
    }

    /// Truncate content to the prompt budget (UTF-8 safe).
    fn truncate_content(text: &str) -> &str {
        crate::pdf::truncate_utf8(text, MAX_CONTENT_CHARS)
    }
}

/// Extract the first JSON object from an LLM response, tolerating code
/// fences and prose around it.
fn extract_json(response: &str) -> Result<serde_json::Value, LlmError> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(value) = serde_json::from_str(cleaned) {
        return Ok(value);
    }

    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&cleaned[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(LlmError::Parse(format!(
        "no JSON object in response: {}",
        crate::pdf::truncate_utf8(cleaned, 200)
    )))
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn string_list(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Classifier for OllamaClient {
    async fn classify_simple(
        &self,
        text: &str,
        filename: Option<&str>,
    ) -> Result<SimpleClassification, LlmError> {
        let prompt = format!(
            "Classify this document into a short category like Invoice, Receipt, \
             Letter, Contract, Statement, Tax, Medical, or Other.\n\
             Filename: {}\n\nDocument text:\n{}\n\n\
             Answer with the category on the first line and a suggested filename \
             (no extension) on the second line.",
            filename.unwrap_or("unknown"),
            Self::truncate_content(text),
        );

        let response = self.generate(&prompt, self.ctx_classify).await?;
        let mut lines = response.lines().map(str::trim).filter(|l| !l.is_empty());
        let category = lines
            .next()
            .map(|l| l.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ').to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| LlmError::Parse("empty classification response".to_string()))?;
        let suggested_filename = lines.next().map(|l| l.to_string());

        Ok(SimpleClassification {
            category,
            suggested_filename,
        })
    }

    async fn classify_structured(
        &self,
        text: &str,
        filename: Option<&str>,
        page_count: Option<u32>,
        size_mb: Option<f64>,
    ) -> Result<Classification, LlmError> {
        let prompt = format!(
            "You are filing scanned documents. Classify the document below.\n\
             Filename: {}\nPages: {}\nSize: {:.1} MB\n\nDocument text:\n{}\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"category\": \"...\", \"confidence\": 0.0-1.0, \
             \"reasoning\": \"...\", \"suggested_filename\": \"...\"}}",
            filename.unwrap_or("unknown"),
            page_count.unwrap_or(0),
            size_mb.unwrap_or(0.0),
            Self::truncate_content(text),
        );

        let response = self.generate(&prompt, self.ctx_classify).await?;
        let value = extract_json(&response)?;
        let category = string_field(&value, "category")
            .ok_or_else(|| LlmError::Parse("missing category".to_string()))?;
        Ok(Classification {
            category,
            confidence: value
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            reasoning: string_field(&value, "reasoning").unwrap_or_default(),
            suggested_filename: string_field(&value, "suggested_filename"),
        })
    }

    async fn analyze_document_type(
        &self,
        sample_texts: &[String],
        filename: &str,
        page_count: u32,
        size_mb: f64,
    ) -> Result<TypeAnalysis, LlmError> {
        let samples = sample_texts
            .iter()
            .enumerate()
            .map(|(i, t)| format!("--- Sample {} ---\n{}", i + 1, Self::truncate_content(t)))
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "A scanner produced this file. Decide if it is ONE logical document \
             (single_document) or a stack of unrelated documents scanned together \
             (batch_scan).\nFilename: {}\nPages: {}\nSize: {:.1} MB\n\n{}\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"classification\": \"single_document\"|\"batch_scan\", \
             \"confidence\": 0-100, \"reasoning\": \"...\"}}",
            filename, page_count, size_mb, samples,
        );

        let response = self.generate(&prompt, self.ctx_detect).await?;
        let value = extract_json(&response)?;
        let classification = string_field(&value, "classification")
            .and_then(|s| ProcessingStrategy::from_str(&s))
            .ok_or_else(|| LlmError::Parse("missing classification".to_string()))?;
        Ok(TypeAnalysis {
            classification,
            confidence: value
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(50.0)
                .clamp(0.0, 100.0),
            reasoning: string_field(&value, "reasoning").unwrap_or_default(),
        })
    }

    async fn extract_tags(&self, text: &str) -> Result<TagSet, LlmError> {
        let prompt = format!(
            "Extract structured tags from this document.\n\nDocument text:\n{}\n\n\
             Respond with ONLY a JSON object with string arrays for the keys: \
             people, organizations, places, dates, document_types, keywords, \
             amounts, reference_numbers.",
            Self::truncate_content(text),
        );

        let response = self.generate(&prompt, self.ctx_tags).await?;
        let value = extract_json(&response)?;
        Ok(TagSet {
            people: string_list(&value, "people"),
            organizations: string_list(&value, "organizations"),
            places: string_list(&value, "places"),
            dates: string_list(&value, "dates"),
            document_types: string_list(&value, "document_types"),
            keywords: string_list(&value, "keywords"),
            amounts: string_list(&value, "amounts"),
            reference_numbers: string_list(&value, "reference_numbers"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let value = extract_json(r#"{"category": "Invoice"}"#).unwrap();
        assert_eq!(value["category"], "Invoice");
    }

    #[test]
    fn test_extract_json_fenced() {
        let value = extract_json("```json\n{\"category\": \"Letter\"}\n```").unwrap();
        assert_eq!(value["category"], "Letter");
    }

    #[test]
    fn test_extract_json_with_prose() {
        let value =
            extract_json("Sure! Here is the result: {\"confidence\": 0.9} Hope that helps.")
                .unwrap();
        assert_eq!(value["confidence"], 0.9);
    }

    #[test]
    fn test_extract_json_failure() {
        assert!(matches!(
            extract_json("no json here"),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn test_string_list_filters_empties() {
        let value = serde_json::json!({"people": ["Ada", "", "  ", "Grace"]});
        assert_eq!(string_list(&value, "people"), vec!["Ada", "Grace"]);
        assert!(string_list(&value, "missing").is_empty());
    }
}
