//! PDF text extraction and image thumbnailing (ingestion helpers for the
//! `pdf` and `image` modalities).
//!
//! Grounded in the teacher's `extract.rs`: same `ExtractError` shape (a
//! plain enum with `Display`/`std::error::Error`, no `thiserror` — the
//! teacher reserves `thiserror` for its richer service-level error type) and
//! the same `pdf_extract::extract_text_from_mem` call. The teacher also
//! extracts DOCX/PPTX/XLSX via `zip`+`quick_xml`; this crate only needs PDF,
//! so those paths and their dependencies are not carried over.

use std::fmt;

use container_core::manifest::ImageConfig;
use image::imageops::FilterType;
use image::ImageFormat;

pub const MIME_PDF: &str = "application/pdf";

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedContentType(String),
    Pdf(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::UnsupportedContentType(ct) => write!(f, "unsupported content type: {ct}"),
            ExtractError::Pdf(msg) => write!(f, "pdf extraction failed: {msg}"),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract plain text from a PDF byte buffer. The pipeline falls back to a
/// single degraded chunk (document state `Degraded`) when this returns an
/// empty string rather than treating extraction failure as fatal (§4.2).
pub fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

#[derive(Debug)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode an image, downscale so the longest edge is at most
/// `config.thumbnail_max_edge`, and re-encode as JPEG at
/// `config.compress_quality`. Images already within bounds are still
/// re-encoded, which keeps the stored thumbnail format uniform.
pub fn make_thumbnail(bytes: &[u8], config: &ImageConfig) -> anyhow::Result<Thumbnail> {
    let img = image::load_from_memory(bytes)?;
    let (w, h) = (img.width(), img.height());
    let max_edge = config.thumbnail_max_edge;
    let resized = if w.max(h) > max_edge {
        img.resize(max_edge, max_edge, FilterType::Lanczos3)
    } else {
        img
    };

    let mut out = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut out);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, config.compress_quality);
    resized.write_with_encoder(encoder)?;
    let _ = ImageFormat::Jpeg;

    Ok(Thumbnail { bytes: out, width: resized.width(), height: resized.height() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_rejects_unknown_content_type() {
        let err = extract_text(b"whatever", "text/plain").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn make_thumbnail_downscales_to_max_edge() {
        let mut buf = Vec::new();
        let img = image::RgbImage::from_pixel(400, 100, image::Rgb([10, 20, 30]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let config = ImageConfig { thumbnail_max_edge: 200, compress_quality: 80 };
        let thumb = make_thumbnail(&buf, &config).unwrap();
        assert_eq!(thumb.width, 200);
        assert_eq!(thumb.height, 50);
    }
}
