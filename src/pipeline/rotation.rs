//! Page orientation: applying known rotations and probing unknown ones.

use std::path::{Path, PathBuf};

use crate::ocr::{OcrError, OcrOutput};

/// Weight of OCR confidence vs extracted-text length in the probe score.
const CONFIDENCE_WEIGHT: f64 = 0.7;

/// Text length at which the length signal saturates.
const LENGTH_SATURATION: f64 = 2000.0;

/// Rotate a rendered page image in place by `angle` degrees clockwise.
/// 0 is a no-op.
pub fn rotate_image_file(path: &Path, angle: u16) -> Result<(), OcrError> {
    if angle % 360 == 0 {
        return Ok(());
    }
    let img = image::open(path).map_err(|e| OcrError::RenderFailed(e.to_string()))?;
    let rotated = match angle % 360 {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        other => {
            return Err(OcrError::RenderFailed(format!(
                "unsupported rotation {}",
                other
            )))
        }
    };
    rotated
        .save(path)
        .map_err(|e| OcrError::RenderFailed(e.to_string()))
}

/// Copy of a rendered page at a given angle, leaving the original intact.
/// Used by the probe, which needs all four orientations of one render.
pub fn rotated_copy(path: &Path, angle: u16) -> Result<PathBuf, OcrError> {
    if angle % 360 == 0 {
        return Ok(path.to_path_buf());
    }
    let target = path.with_file_name(format!(
        "{}_{}.png",
        path.file_stem().and_then(|s| s.to_str()).unwrap_or("page"),
        angle
    ));
    std::fs::copy(path, &target)?;
    rotate_image_file(&target, angle)?;
    Ok(target)
}

/// Orientation score: mostly confidence, with extracted length as the
/// tie-breaker for pages where every orientation "reads".
pub fn orientation_score(output: &OcrOutput) -> f64 {
    let confidence = output.confidence.unwrap_or(0.0);
    let length = (output.text.chars().count() as f64).min(LENGTH_SATURATION)
        / LENGTH_SATURATION
        * 100.0;
    confidence * CONFIDENCE_WEIGHT + length * (1.0 - CONFIDENCE_WEIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn output(confidence: f64, text: &str) -> OcrOutput {
        OcrOutput {
            text: text.to_string(),
            confidence: Some(confidence),
            words: Vec::new(),
            processing_time_ms: 0,
        }
    }

    #[test]
    fn test_orientation_score_prefers_confident_text() {
        let upright = output(95.0, "a perfectly readable page of text");
        let sideways = output(20.0, "j$ %kd");
        assert!(orientation_score(&upright) > orientation_score(&sideways));
    }

    #[test]
    fn test_orientation_score_length_breaks_ties() {
        let long = output(80.0, &"word ".repeat(300));
        let short = output(80.0, "word");
        assert!(orientation_score(&long) > orientation_score(&short));
    }

    #[test]
    fn test_rotate_image_file_swaps_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page.png");
        let img = image::ImageBuffer::from_pixel(10, 20, image::Rgb([0u8, 0, 0]));
        img.save(&path).unwrap();

        rotate_image_file(&path, 90).unwrap();
        let rotated = image::open(&path).unwrap();
        assert_eq!(
            (rotated.width(), rotated.height()),
            (20, 10)
        );
    }

    #[test]
    fn test_rotated_copy_preserves_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page.png");
        let img = image::ImageBuffer::from_pixel(10, 20, image::Rgb([0u8, 0, 0]));
        img.save(&path).unwrap();

        let copy = rotated_copy(&path, 180).unwrap();
        assert_ne!(copy, path);
        assert!(path.exists());
        assert!(copy.exists());
    }
}
