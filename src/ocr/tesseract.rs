//! Tesseract OCR engine.
//!
//! Uses the tesseract and poppler command-line tools. TSV output is parsed
//! for per-word confidence so the rotation probe has a usable signal.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use super::{check_binary, find_page_image, OcrEngine, OcrError, OcrOutput, WordBox};

pub struct TesseractEngine {
    language: String,
}

impl TesseractEngine {
    pub fn new() -> Self {
        Self {
            language: "eng".to_string(),
        }
    }

    pub fn with_language(mut self, lang: &str) -> Self {
        self.language = lang.to_string();
        self
    }

    /// Run tesseract in TSV mode and collect text plus word boxes.
    fn run_tesseract_tsv(&self, image_path: &Path) -> Result<OcrOutput, OcrError> {
        let start = Instant::now();
        let output = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.language, "tsv"])
            .output();

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(OcrError::OcrFailed(format!("tesseract failed: {}", stderr)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OcrError::ToolNotFound(
                    "tesseract (install tesseract-ocr)".to_string(),
                ));
            }
            Err(e) => return Err(OcrError::Io(e)),
        };

        let tsv = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_tsv(&tsv);
        Ok(OcrOutput {
            text: parsed.text,
            confidence: parsed.confidence,
            words: parsed.words,
            processing_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn is_available(&self) -> bool {
        check_binary("tesseract") && check_binary("pdftoppm")
    }

    fn render_page(
        &self,
        pdf: &Path,
        page_index: u32,
        scale: f32,
        out_dir: &Path,
    ) -> Result<PathBuf, OcrError> {
        let dpi = (scale * 72.0).round().max(36.0) as u32;
        // pdftoppm pages are 1-based
        let page = page_index + 1;
        let page_str = page.to_string();
        let output_prefix = out_dir.join("page");

        let status = Command::new("pdftoppm")
            .args(["-png", "-r", &dpi.to_string(), "-f", &page_str, "-l", &page_str])
            .arg(pdf)
            .arg(&output_prefix)
            .status();

        match status {
            Ok(s) if s.success() => find_page_image(out_dir, page).ok_or_else(|| {
                OcrError::RenderFailed(format!("no image generated for page {}", page))
            }),
            Ok(_) => Err(OcrError::RenderFailed(format!(
                "pdftoppm failed on page {}",
                page
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OcrError::ToolNotFound(
                "pdftoppm (install poppler-utils)".to_string(),
            )),
            Err(e) => Err(OcrError::Io(e)),
        }
    }

    fn ocr_image(&self, image: &Path) -> Result<OcrOutput, OcrError> {
        self.run_tesseract_tsv(image)
    }
}

struct ParsedTsv {
    text: String,
    confidence: Option<f64>,
    words: Vec<WordBox>,
}

/// Parse tesseract TSV output. Word rows are level 5; the line number
/// changing means a line break in the reconstructed text.
fn parse_tsv(tsv: &str) -> ParsedTsv {
    let mut text = String::new();
    let mut words = Vec::new();
    let mut conf_sum = 0.0_f64;
    let mut conf_count = 0usize;
    let mut last_line_key: Option<(u32, u32, u32)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let level: u32 = cols[0].parse().unwrap_or(0);
        if level != 5 {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }

        let block: u32 = cols[2].parse().unwrap_or(0);
        let par: u32 = cols[3].parse().unwrap_or(0);
        let line: u32 = cols[4].parse().unwrap_or(0);
        let line_key = (block, par, line);

        match last_line_key {
            Some(prev) if prev == line_key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        last_line_key = Some(line_key);
        text.push_str(word);

        let conf: f64 = cols[10].parse().unwrap_or(-1.0);
        if conf >= 0.0 {
            conf_sum += conf;
            conf_count += 1;
        }

        words.push(WordBox {
            text: word.to_string(),
            left: cols[6].parse().unwrap_or(0),
            top: cols[7].parse().unwrap_or(0),
            width: cols[8].parse().unwrap_or(0),
            height: cols[9].parse().unwrap_or(0),
            confidence: conf.max(0.0),
        });
    }

    let confidence = (conf_count > 0).then(|| conf_sum / conf_count as f64);
    ParsedTsv {
        text,
        confidence,
        words,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
        1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
        5\t1\t1\t1\t1\t1\t10\t10\t40\t12\t96.5\tHello\n\
        5\t1\t1\t1\t1\t2\t55\t10\t40\t12\t91.5\tworld\n\
        5\t1\t1\t1\t2\t1\t10\t30\t60\t12\t88.0\tsecond\n";

    #[test]
    fn test_parse_tsv_reconstructs_lines() {
        let parsed = parse_tsv(SAMPLE);
        assert_eq!(parsed.text, "Hello world\nsecond");
        assert_eq!(parsed.words.len(), 3);
    }

    #[test]
    fn test_parse_tsv_averages_confidence() {
        let parsed = parse_tsv(SAMPLE);
        let conf = parsed.confidence.unwrap();
        assert!((conf - 92.0).abs() < 0.01);
    }

    #[test]
    fn test_parse_tsv_skips_non_word_rows() {
        let parsed = parse_tsv("level\tcols\n1\t1\t0\t0\t0\t0\t0\t0\t0\t0\t-1\t\n");
        assert!(parsed.text.is_empty());
        assert!(parsed.confidence.is_none());
    }
}
