//! Page image loading
//!
//! Raster files are decoded by content, so a mislabeled extension still
//! loads. PDFs are detected by their magic bytes and only the first page is
//! rasterized, through poppler's `pdftoppm`.

use image::DynamicImage;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

use crate::config::LoaderSettings;
use crate::error::{FormscanError, Result};

const PDF_MAGIC: &[u8] = b"%PDF-";

/// What a loaded page is used for; decides the PDF rasterization resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPurpose {
    /// Full resolution for OCR
    Extraction,
    /// Reduced resolution for display
    Preview,
}

/// Anything that turns a path into a decoded page.
///
/// `None` means the file is missing or could not be decoded.
pub trait ImageSource: Send + Sync {
    fn load(&self, path: &Path, purpose: LoadPurpose) -> Option<DynamicImage>;
}

/// File-system image source backed by the `image` crate and `pdftoppm`
#[derive(Debug, Clone)]
pub struct ImageLoader {
    settings: LoaderSettings,
}

impl ImageLoader {
    pub fn new(settings: LoaderSettings) -> Self {
        Self { settings }
    }

    fn dpi(&self, purpose: LoadPurpose) -> u32 {
        match purpose {
            LoadPurpose::Extraction => self.settings.extraction_dpi,
            LoadPurpose::Preview => self.settings.preview_dpi,
        }
    }

    /// Decode a file, surfacing the reason on failure
    pub fn try_load(&self, path: &Path, purpose: LoadPurpose) -> Result<DynamicImage> {
        let bytes = std::fs::read(path)?;

        if is_pdf(&bytes) {
            let png = self.rasterize_first_page(path, self.dpi(purpose))?;
            return Ok(image::load_from_memory(&png)?);
        }

        Ok(image::load_from_memory(&bytes)?)
    }

    fn rasterize_first_page(&self, path: &Path, dpi: u32) -> Result<Vec<u8>> {
        debug!("Rasterizing {} at {} dpi", path.display(), dpi);

        // No output root: pdftoppm writes the single page to stdout
        let output = Command::new(&self.settings.pdftoppm_cmd)
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .args(["-f", "1", "-l", "1", "-singlefile"])
            .arg(path)
            .output()
            .map_err(|e| {
                FormscanError::Extraction(format!(
                    "failed to invoke {}: {e}; is poppler-utils installed?",
                    self.settings.pdftoppm_cmd
                ))
            })?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("pdftoppm failed with status {}: {}", output.status, stderr.trim());
            return Err(FormscanError::Decode {
                path: path.to_path_buf(),
            });
        }

        Ok(output.stdout)
    }
}

impl ImageSource for ImageLoader {
    fn load(&self, path: &Path, purpose: LoadPurpose) -> Option<DynamicImage> {
        match self.try_load(path, purpose) {
            Ok(image) => Some(image),
            Err(e) => {
                debug!("Cannot load {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// True when the bytes start with the PDF header
pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}
