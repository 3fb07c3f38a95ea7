//! Application Configuration
//!
//! OCR backend, registration and loader settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// OCR backend and preprocessing settings
    pub ocr: OcrSettings,
    /// Template registration settings
    pub registration: RegistrationSettings,
    /// Image/PDF decoding settings
    pub loader: LoaderSettings,
    /// Storage locations
    pub storage: StorageSettings,
}

/// OCR backend and preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Path or name of the tesseract executable
    pub tesseract_cmd: String,
    /// Recognition languages, tesseract syntax (e.g. "kor+eng")
    pub languages: String,
    /// Page segmentation mode; 7 treats the crop as a single text line
    pub page_seg_mode: u8,
    /// OCR engine mode
    pub engine_mode: u8,
    /// Kill a backend call that runs longer than this (0 disables the watchdog)
    pub timeout_secs: u64,
    /// Remove all interior whitespace from results. Only correct for scripts
    /// that are not space-delimited.
    pub strip_interior_whitespace: bool,
    /// Preprocessing applied to every crop before recognition
    pub preprocessing: OcrPreprocessing,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            tesseract_cmd: "tesseract".to_string(),
            languages: "kor+eng".to_string(),
            page_seg_mode: 7,
            engine_mode: 3,
            timeout_secs: 30,
            strip_interior_whitespace: true,
            preprocessing: OcrPreprocessing::default(),
        }
    }
}

/// Crop preprocessing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrPreprocessing {
    /// Upscale factor applied with cubic interpolation
    pub scale: u32,
    /// Adaptive threshold window (odd, in pixels of the upscaled crop)
    pub block_size: u32,
    /// Bias subtracted from the local mean before thresholding
    pub threshold_bias: f32,
    /// Side of the square morphology kernel
    pub kernel_size: u32,
}

impl Default for OcrPreprocessing {
    fn default() -> Self {
        Self {
            scale: 3,
            block_size: 31,
            threshold_bias: 11.0,
            kernel_size: 2,
        }
    }
}

/// Feature-based template registration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    /// Align scans to the profile template before mapping regions
    pub enabled: bool,
    /// Keypoint cap per image
    pub max_features: usize,
    /// Fraction of cross-checked matches kept as correspondences
    pub good_match_percent: f32,
    /// RANSAC inlier reprojection threshold in pixels
    pub ransac_threshold: f64,
    /// RANSAC iteration count
    pub ransac_iterations: usize,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_features: 2000,
            good_match_percent: 0.15,
            ransac_threshold: 3.0,
            ransac_iterations: 2000,
        }
    }
}

/// Image and PDF decoding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// PDF rasterization resolution used for extraction
    pub extraction_dpi: u32,
    /// PDF rasterization resolution used for previews
    pub preview_dpi: u32,
    /// Path or name of the pdftoppm executable
    pub pdftoppm_cmd: String,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            extraction_dpi: 300,
            preview_dpi: 100,
            pdftoppm_cmd: "pdftoppm".to_string(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Profile catalog file; defaults to `profiles.json` in the data directory
    pub profiles_path: Option<PathBuf>,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert_eq!(config.ocr.tesseract_cmd, "tesseract");
        assert_eq!(config.ocr.languages, "kor+eng");
        assert_eq!(config.ocr.page_seg_mode, 7);
        assert!(config.ocr.strip_interior_whitespace);

        assert_eq!(config.ocr.preprocessing.scale, 3);
        assert_eq!(config.ocr.preprocessing.block_size, 31);
        assert!((config.ocr.preprocessing.threshold_bias - 11.0).abs() < 0.01);
        assert_eq!(config.ocr.preprocessing.kernel_size, 2);

        assert!(!config.registration.enabled);
        assert_eq!(config.registration.max_features, 2000);
        assert!((config.registration.good_match_percent - 0.15).abs() < 0.001);

        assert_eq!(config.loader.extraction_dpi, 300);
        assert!(config.loader.preview_dpi < config.loader.extraction_dpi);
        assert!(config.storage.profiles_path.is_none());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.ocr.languages = "eng".to_string();
        config.registration.enabled = true;
        config.storage.profiles_path = Some(PathBuf::from("/tmp/profiles.json"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.ocr.languages, "eng");
        assert!(parsed.registration.enabled);
        assert_eq!(parsed.storage.profiles_path, config.storage.profiles_path);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: AppConfig = toml::from_str("[ocr]\ntimeout_secs = 5\n").unwrap();
        assert_eq!(parsed.ocr.timeout_secs, 5);
        assert_eq!(parsed.ocr.tesseract_cmd, "tesseract");
        assert_eq!(parsed.registration.max_features, 2000);
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.ocr.timeout_secs, loaded.ocr.timeout_secs);
        assert_eq!(config.loader.extraction_dpi, loaded.loader.extraction_dpi);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
