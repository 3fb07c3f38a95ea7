//! Region text extraction
//!
//! Crops one region out of a page, preprocesses it and hands it to the OCR
//! backend. The backend is an explicit handle created once at startup and
//! shared by every call in a run.

use image::{DynamicImage, GrayImage};
use std::sync::Arc;
use tracing::debug;

use crate::config::{OcrPreprocessing, OcrSettings};
use crate::error::Result;
use crate::vision::geometry::{clamp_rect, PixelRect};
use crate::vision::ocr_preprocess::preprocess;

/// A text recognizer for a single preprocessed text line
pub trait OcrBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Recognize the text in a binarized single-line crop
    fn recognize_line(&self, image: &GrayImage) -> Result<String>;
}

/// OCR engine wrapper that applies the crop/preprocess/normalize policy
#[derive(Clone)]
pub struct OcrExtractor {
    backend: Arc<dyn OcrBackend>,
    preprocessing: OcrPreprocessing,
    strip_interior_whitespace: bool,
}

impl OcrExtractor {
    pub fn new(backend: Arc<dyn OcrBackend>, settings: &OcrSettings) -> Self {
        Self {
            backend,
            preprocessing: settings.preprocessing.clone(),
            strip_interior_whitespace: settings.strip_interior_whitespace,
        }
    }

    /// Name of the underlying backend
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Extract text from a raw rectangle, clamped to the image first
    pub fn extract(&self, image: &DynamicImage, x: i64, y: i64, w: i64, h: i64) -> Result<String> {
        let rect = clamp_rect(x, y, w, h, image.width(), image.height());
        self.extract_rect(image, rect)
    }

    /// Extract text from a rectangle already inside the image
    pub fn extract_rect(&self, image: &DynamicImage, rect: PixelRect) -> Result<String> {
        let crop = image.crop_imm(rect.x, rect.y, rect.width, rect.height);
        let processed = preprocess(&crop, &self.preprocessing);
        let raw = self.backend.recognize_line(&processed)?;
        let text = normalize_text(&raw, self.strip_interior_whitespace);

        debug!(
            "OCR ({}) at ({}, {}) {}x{}: {:?}",
            self.backend.name(),
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            text
        );
        Ok(text)
    }
}

/// Trim the backend output; optionally drop every interior whitespace character.
///
/// Dropping interior whitespace suits scripts that are not space-delimited
/// (the backend tends to insert spurious gaps between glyphs).
pub fn normalize_text(raw: &str, strip_interior_whitespace: bool) -> String {
    let trimmed = raw.trim();
    if strip_interior_whitespace {
        trimmed.chars().filter(|c| !c.is_whitespace()).collect()
    } else {
        trimmed.to_string()
    }
}
