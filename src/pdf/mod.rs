//! PDF assembly and manipulation.
//!
//! Everything that writes PDF bytes lives here: normalized single-page PDFs
//! from intake images, searchable PDFs with an invisible text overlay, and
//! the angle-tagged rotation cache used by the viewer routes.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("PDF error: {0}")]
    Lopdf(#[from] lopdf::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// One page of an image-backed PDF under assembly.
pub struct PageSpec {
    /// JPEG-encoded page raster.
    pub jpeg: Vec<u8>,
    pub width_px: u32,
    pub height_px: u32,
    /// Page size in PDF points.
    pub width_pt: f32,
    pub height_pt: f32,
    /// Invisible overlay text, already truncated by the caller.
    pub text: Option<String>,
}

impl PageSpec {
    /// Build a page from any raster the `image` crate can decode,
    /// re-encoded as JPEG at `quality`. Page points derive from `dpi`.
    pub fn from_image_file(
        path: &Path,
        dpi: u32,
        quality: u8,
        text: Option<String>,
    ) -> Result<Self, PdfError> {
        let img = image::open(path)?;
        Self::from_dynamic_image(&img, dpi, quality, text)
    }

    pub fn from_dynamic_image(
        img: &image::DynamicImage,
        dpi: u32,
        quality: u8,
        text: Option<String>,
    ) -> Result<Self, PdfError> {
        if dpi == 0 {
            return Err(PdfError::Invalid("dpi must be positive".into()));
        }
        let (width_px, height_px) = img.dimensions();
        let rgb = img.to_rgb8();
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), quality);
        encoder.encode(
            rgb.as_raw(),
            width_px,
            height_px,
            image::ExtendedColorType::Rgb8,
        )?;
        Ok(Self {
            jpeg,
            width_px,
            height_px,
            width_pt: width_px as f32 * 72.0 / dpi as f32,
            height_pt: height_px as f32 * 72.0 / dpi as f32,
            text,
        })
    }
}

/// Write an image-backed PDF. Each page is a full-bleed JPEG XObject; pages
/// with overlay text get an invisible (render mode 3) text run so viewers
/// can search and select.
pub fn write_image_pdf(pages: &[PageSpec], out: &Path) -> Result<(), PdfError> {
    if pages.is_empty() {
        return Err(PdfError::Invalid("no pages to write".into()));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for (index, page) in pages.iter().enumerate() {
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => page.width_px as i64,
                "Height" => page.height_px as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            page.jpeg.clone(),
        ));

        let image_name = format!("Im{}", index);
        let mut operations = vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    page.width_pt.into(),
                    0.into(),
                    0.into(),
                    page.height_pt.into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(image_name.clone().into_bytes())]),
            Operation::new("Q", vec![]),
        ];
        if let Some(text) = page.text.as_deref().filter(|t| !t.is_empty()) {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new(
                "Tf",
                vec![Object::Name(b"F1".to_vec()), 8.into()],
            ));
            operations.push(Operation::new("Tr", vec![3.into()]));
            operations.push(Operation::new("Td", vec![4.into(), 4.into()]));
            operations.push(Operation::new(
                "Tj",
                vec![Object::string_literal(printable_overlay(text))],
            ));
            operations.push(Operation::new("ET", vec![]));
        }

        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));

        let mut xobjects = Dictionary::new();
        xobjects.set(image_name.into_bytes(), Object::Reference(image_id));
        let mut fonts = Dictionary::new();
        fonts.set("F1", Object::Reference(font_id));
        let mut resources = Dictionary::new();
        resources.set("XObject", Object::Dictionary(xobjects));
        resources.set("Font", Object::Dictionary(fonts));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![
                0.into(),
                0.into(),
                page.width_pt.into(),
                page.height_pt.into(),
            ],
            "Contents" => Object::Reference(content_id),
            "Resources" => Object::Dictionary(resources),
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    doc.save(out)?;
    Ok(())
}

/// Render a raster image into a single-page PDF at the given DPI.
pub fn image_to_pdf(image_path: &Path, out: &Path, dpi: u32, quality: u8) -> Result<(), PdfError> {
    let page = PageSpec::from_image_file(image_path, dpi, quality, None)?;
    write_image_pdf(&[page], out)
}

/// Number of pages in a PDF.
pub fn page_count(path: &Path) -> Result<u32, PdfError> {
    let doc = Document::load(path)?;
    Ok(doc.get_pages().len() as u32)
}

/// Embedded text of one zero-based page, None when the layer is empty.
pub fn embedded_page_text(path: &Path, page_index: u32) -> Option<String> {
    let doc = Document::load(path).ok()?;
    let text = doc.extract_text(&[page_index + 1]).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Serve-side rotation cache: `{hash}_r{angle}.pdf` next to the normalized
/// PDF. Returns the path plus whether an existing file was reused; a reused
/// file is never rewritten, which is what makes matching-angle serves a
/// byte no-op.
pub fn ensure_rotated(
    normalized: &Path,
    cache_dir: &Path,
    content_hash: &str,
    angle: u16,
) -> Result<(PathBuf, bool), PdfError> {
    let angle = angle % 360;
    if angle == 0 {
        return Ok((normalized.to_path_buf(), true));
    }
    if ![90, 180, 270].contains(&angle) {
        return Err(PdfError::Invalid(format!("unsupported angle {}", angle)));
    }

    let target = cache_dir.join(format!("{}_r{}.pdf", content_hash, angle));
    if target.exists() {
        return Ok((target, true));
    }

    let mut doc = Document::load(normalized)?;
    let pages: Vec<_> = doc.get_pages().values().copied().collect();
    for page_id in pages {
        let dict = doc.get_object_mut(page_id)?.as_dict_mut()?;
        dict.set("Rotate", angle as i64);
    }

    // tmp + atomic rename so a concurrent same-angle request never sees a
    // half-written file
    let tmp = cache_dir.join(format!(".{}_r{}.pdf.tmp", content_hash, angle));
    doc.save(&tmp)?;
    std::fs::rename(&tmp, &target)?;
    Ok((target, false))
}

/// Keep overlay text inside what a Type1 literal string can carry.
fn printable_overlay(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\n' | '\r' | '\t' => ' ',
            c if (' '..='~').contains(&c) => c,
            _ => '?',
        })
        .collect()
}

/// Truncate to a byte budget on a UTF-8 boundary.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn white_image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let img = image::ImageBuffer::from_pixel(30, 40, image::Rgb([250u8, 250, 250]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_image_to_pdf_page_geometry() {
        let dir = tempdir().unwrap();
        let img = white_image(dir.path(), "photo.png");
        let out = dir.path().join("photo.pdf");
        image_to_pdf(&img, &out, 150, 95).unwrap();

        assert_eq!(page_count(&out).unwrap(), 1);
        let doc = Document::load(&out).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let media_box = doc
            .get_dictionary(page_id)
            .unwrap()
            .get(b"MediaBox")
            .unwrap()
            .as_array()
            .unwrap()
            .clone();
        // 30px at 150dpi = 14.4pt
        let width = match media_box[2] {
            Object::Real(r) => r as f64,
            Object::Integer(i) => i as f64,
            ref other => panic!("unexpected MediaBox entry: {:?}", other),
        };
        assert!((width - 14.4).abs() < 0.01);
    }

    #[test]
    fn test_searchable_overlay_is_extractable() {
        let dir = tempdir().unwrap();
        let img = white_image(dir.path(), "page.png");
        let page = PageSpec::from_image_file(&img, 150, 95, Some("Quarterly Report 2024".into()))
            .unwrap();
        let out = dir.path().join("searchable.pdf");
        write_image_pdf(&[page], &out).unwrap();

        let text = embedded_page_text(&out, 0).unwrap();
        assert!(text.contains("Quarterly Report 2024"));
    }

    #[test]
    fn test_ensure_rotated_reuses_cached_file() {
        let dir = tempdir().unwrap();
        let img = white_image(dir.path(), "page.png");
        let normalized = dir.path().join("abc123.pdf");
        image_to_pdf(&img, &normalized, 150, 95).unwrap();

        let (first, reused) =
            ensure_rotated(&normalized, dir.path(), "abc123", 90).unwrap();
        assert!(!reused);
        let bytes_before = std::fs::read(&first).unwrap();

        let (second, reused) =
            ensure_rotated(&normalized, dir.path(), "abc123", 90).unwrap();
        assert!(reused);
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), bytes_before);
    }

    #[test]
    fn test_ensure_rotated_zero_is_identity() {
        let dir = tempdir().unwrap();
        let img = white_image(dir.path(), "page.png");
        let normalized = dir.path().join("zzz.pdf");
        image_to_pdf(&img, &normalized, 150, 95).unwrap();
        let (path, reused) = ensure_rotated(&normalized, dir.path(), "zzz", 0).unwrap();
        assert!(reused);
        assert_eq!(path, normalized);
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let text = "héllo wörld";
        let truncated = truncate_utf8(text, 3);
        assert!(truncated.len() <= 3);
        assert!(text.starts_with(truncated));
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}
