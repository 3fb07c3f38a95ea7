//! Vision/OCR Layer
//!
//! Everything that touches pixels: region geometry, page loading, template
//! registration, crop preprocessing and the OCR backends.

pub mod geometry;
pub mod loader;
pub mod ocr;
pub mod ocr_preprocess;
pub mod registration;
pub mod tesseract;

pub use geometry::{RatioRect, RoiInput};
pub use loader::{ImageLoader, ImageSource, LoadPurpose};
pub use ocr::{OcrBackend, OcrExtractor};
pub use registration::{AlignmentOutcome, ImageRegistrar, RegistrationParams};
pub use tesseract::TesseractCli;
