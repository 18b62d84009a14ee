//! Configuration management.
//!
//! Settings are loaded once at startup from an optional `docuflow.toml`
//! plus `DOCUFLOW_*` environment overrides, and are immutable afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default database filename inside the data directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "docuflow.db";

/// DPI used when rendering intake images into normalized PDFs.
pub const DEFAULT_NORMALIZE_DPI: u32 = 150;

/// JPEG quality for normalized image pages.
pub const NORMALIZE_JPEG_QUALITY: u8 = 95;

fn default_data_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docuflow")
}

fn default_database_filename() -> String {
    DEFAULT_DATABASE_FILENAME.to_string()
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_ollama_timeout_secs() -> u64 {
    45
}

fn default_ocr_render_scale() -> f32 {
    // ~300 DPI at the PDF's 72-point baseline
    4.17
}

fn default_ocr_overlay_text_limit() -> usize {
    32 * 1024
}

fn default_ocr_timeout_secs() -> u64 {
    60
}

fn default_normalize_dpi() -> u32 {
    DEFAULT_NORMALIZE_DPI
}

fn default_cache_max_age_days() -> u64 {
    30
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_llm_concurrency() -> usize {
    2
}

fn default_token_ttl_secs() -> u64 {
    300
}

fn default_gc_interval_secs() -> u64 {
    3600
}

fn default_token_cleanup_interval_secs() -> u64 {
    30
}

/// Immutable application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base data directory; relative sub-paths hang off it.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Database filename within the data directory.
    #[serde(default = "default_database_filename")]
    pub database_filename: String,
    /// Directory watched for new artifacts. Defaults to `{data_dir}/intake`.
    #[serde(default)]
    pub intake_dir: Option<PathBuf>,
    /// Directory for searchable PDFs. Defaults to `{data_dir}/processed`.
    #[serde(default)]
    pub processed_dir: Option<PathBuf>,
    /// Terminal storage tree for exported PDFs. Defaults to
    /// `{data_dir}/filing_cabinet`.
    #[serde(default)]
    pub filing_cabinet_dir: Option<PathBuf>,
    /// Content-addressed normalized PDF cache. Defaults to
    /// `{data_dir}/normalized`.
    #[serde(default)]
    pub normalized_cache_dir: Option<PathBuf>,

    /// Ollama endpoint for classification and tagging.
    #[serde(default = "default_ollama_host")]
    pub ollama_host: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
    #[serde(default = "default_ollama_timeout_secs")]
    pub ollama_timeout_secs: u64,
    /// Optional per-task context window overrides.
    #[serde(default)]
    pub ollama_ctx_classify: Option<u32>,
    #[serde(default)]
    pub ollama_ctx_detect: Option<u32>,
    #[serde(default)]
    pub ollama_ctx_tags: Option<u32>,

    /// Render scale for searchable-PDF rasterization (multiplied by 72 DPI).
    #[serde(default = "default_ocr_render_scale")]
    pub ocr_render_scale: f32,
    /// Byte cap for the invisible text overlay, per page.
    #[serde(default = "default_ocr_overlay_text_limit")]
    pub ocr_overlay_text_limit: usize,
    /// Per-page OCR timeout.
    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,
    /// DPI for rendering intake images into normalized PDFs.
    #[serde(default = "default_normalize_dpi")]
    pub normalize_dpi: u32,
    /// Age after which unused normalized PDFs are garbage-collected.
    #[serde(default = "default_cache_max_age_days")]
    pub normalized_cache_max_age_days: u64,

    /// Bounded parallelism for artifact jobs. One per logical CPU by default.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Concurrent requests against the local LLM host.
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,

    /// Bypass OCR and LLM with deterministic fallbacks (tests only).
    #[serde(default)]
    pub fast_test_mode: bool,
    /// Run the tag extractor after successful exports.
    #[serde(default)]
    pub enable_tag_extraction: bool,

    /// How long completed smart tokens stay resolvable.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    #[serde(default = "default_token_cleanup_interval_secs")]
    pub token_cleanup_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_filename: default_database_filename(),
            intake_dir: None,
            processed_dir: None,
            filing_cabinet_dir: None,
            normalized_cache_dir: None,
            ollama_host: default_ollama_host(),
            ollama_model: default_ollama_model(),
            ollama_timeout_secs: default_ollama_timeout_secs(),
            ollama_ctx_classify: None,
            ollama_ctx_detect: None,
            ollama_ctx_tags: None,
            ocr_render_scale: default_ocr_render_scale(),
            ocr_overlay_text_limit: default_ocr_overlay_text_limit(),
            ocr_timeout_secs: default_ocr_timeout_secs(),
            normalize_dpi: default_normalize_dpi(),
            normalized_cache_max_age_days: default_cache_max_age_days(),
            workers: default_workers(),
            llm_concurrency: default_llm_concurrency(),
            fast_test_mode: false,
            enable_tag_extraction: false,
            token_ttl_secs: default_token_ttl_secs(),
            gc_interval_secs: default_gc_interval_secs(),
            token_cleanup_interval_secs: default_token_cleanup_interval_secs(),
        }
    }
}

impl Settings {
    /// Create settings rooted at a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Load settings from an explicit config file, `./docuflow.toml`, or
    /// defaults, then apply environment overrides.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match config_path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let candidate = PathBuf::from("docuflow.toml");
                candidate.exists().then_some(candidate)
            }
        };

        let mut settings: Settings = match path {
            Some(ref p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("cannot read {}: {}", p.display(), e))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid config {}: {}", p.display(), e))?
            }
            None => Settings::default(),
        };

        if let Ok(dir) = std::env::var("DOCUFLOW_DATA_DIR") {
            settings.data_dir = expand_path(&dir);
        }
        if let Ok(host) = std::env::var("DOCUFLOW_OLLAMA_HOST") {
            settings.ollama_host = host;
        }
        if let Ok(model) = std::env::var("DOCUFLOW_OLLAMA_MODEL") {
            settings.ollama_model = model;
        }
        if let Ok(v) = std::env::var("DOCUFLOW_FAST_TEST_MODE") {
            settings.fast_test_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }

        Ok(settings)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    pub fn intake_dir(&self) -> PathBuf {
        self.intake_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("intake"))
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.processed_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("processed"))
    }

    pub fn filing_cabinet_dir(&self) -> PathBuf {
        self.filing_cabinet_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("filing_cabinet"))
    }

    pub fn normalized_cache_dir(&self) -> PathBuf {
        self.normalized_cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("normalized"))
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.intake_dir(),
            self.processed_dir(),
            self.filing_cabinet_dir(),
            self.normalized_cache_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Expand `~` and environment variables in a user-supplied path.
fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ollama_timeout_secs, 45);
        assert_eq!(settings.normalize_dpi, 150);
        assert!(!settings.fast_test_mode);
        assert!(settings.workers >= 1);
    }

    #[test]
    fn test_derived_directories() {
        let settings = Settings::with_data_dir(PathBuf::from("/data"));
        assert_eq!(settings.intake_dir(), PathBuf::from("/data/intake"));
        assert_eq!(
            settings.normalized_cache_dir(),
            PathBuf::from("/data/normalized")
        );
        assert_eq!(settings.database_path(), PathBuf::from("/data/docuflow.db"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings: Settings =
            toml::from_str("ollama_model = \"mistral\"\nworkers = 2\n").unwrap();
        assert_eq!(settings.ollama_model, "mistral");
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.ollama_timeout_secs, 45);
    }
}
