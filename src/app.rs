//! Application Coordinator
//!
//! Owns the shared profile store and the OCR backend handle, and launches
//! batches on a background worker thread.

use anyhow::{Context, Result};
use indexmap::IndexSet;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::batch::{BatchHandle, BatchOrchestrator, BatchRequest};
use crate::config::AppConfig;
use crate::storage::ProfileStore;
use crate::vision::{
    AlignmentOutcome, ImageLoader, ImageRegistrar, ImageSource, LoadPurpose, OcrBackend,
    OcrExtractor, RegistrationParams, TesseractCli,
};

/// File extensions picked up when walking a directory
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "pdf", "bmp"];

/// Main application coordinator
pub struct FormscanApp {
    config: AppConfig,
    profiles: Arc<RwLock<ProfileStore>>,
    backend: Arc<dyn OcrBackend>,
    source: Arc<dyn ImageSource>,
}

impl FormscanApp {
    /// Create the coordinator with the tesseract backend.
    ///
    /// Fails when the backend cannot be run, before any batch is started.
    pub fn new(config: AppConfig, profiles: ProfileStore) -> Result<Self> {
        let backend = TesseractCli::new(&config.ocr).context("Failed to initialize OCR backend")?;
        let source = ImageLoader::new(config.loader.clone());
        Ok(Self::with_backend(config, profiles, Arc::new(backend), Arc::new(source)))
    }

    /// Create the coordinator around explicit collaborators
    pub fn with_backend(
        config: AppConfig,
        profiles: ProfileStore,
        backend: Arc<dyn OcrBackend>,
        source: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            config,
            profiles: Arc::new(RwLock::new(profiles)),
            backend,
            source,
        }
    }

    /// Shared profile store
    pub fn profiles(&self) -> Arc<RwLock<ProfileStore>> {
        self.profiles.clone()
    }

    /// Snapshot the catalog and start a batch in the background
    pub fn start_batch(&self, request: BatchRequest) -> BatchHandle {
        let catalog = self.profiles.read().snapshot();
        let extractor = OcrExtractor::new(self.backend.clone(), &self.config.ocr);
        let mut orchestrator = BatchOrchestrator::new(catalog, extractor, self.source.clone());

        if self.config.registration.enabled {
            let params = RegistrationParams::from(&self.config.registration);
            orchestrator = orchestrator.with_registration(ImageRegistrar::new(params));
        }

        info!("Starting batch over {} files", request.files.len());
        orchestrator.spawn(request)
    }

    /// Read one pixel rectangle of a page, optionally aligned to a template
    /// first. The rectangle is clamped to the page.
    pub fn read_region(
        &self,
        page: &Path,
        template: Option<&Path>,
        rect: [i64; 4],
    ) -> Result<String> {
        let image = self
            .source
            .load(page, LoadPurpose::Extraction)
            .with_context(|| format!("Cannot load {:?}", page))?;

        let outcome = match template {
            Some(template_path) => {
                let template = self
                    .source
                    .load(template_path, LoadPurpose::Extraction)
                    .with_context(|| format!("Cannot load template {:?}", template_path))?;
                let params = RegistrationParams::from(&self.config.registration);
                ImageRegistrar::new(params).align(image, &template)
            }
            None => AlignmentOutcome::Unaligned { image },
        };
        match (template, outcome.homography()) {
            (_, Some(homography)) => debug!("Aligned {:?} with {:?}", page, homography),
            (Some(template_path), None) => {
                warn!("Could not align {:?} to {:?}", page, template_path)
            }
            (None, None) => {}
        }

        let [x, y, w, h] = rect;
        let extractor = OcrExtractor::new(self.backend.clone(), &self.config.ocr);
        let text = extractor.extract(outcome.image(), x, y, w, h)?;
        Ok(text)
    }
}

/// Expand the given paths into an input file list.
///
/// Files are kept as given. Directories are walked recursively for supported
/// extensions, entries sorted by name within each directory. Duplicates keep
/// their first position.
pub fn discover_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = IndexSet::new();
    for path in paths {
        if path.is_dir() {
            walk_dir(path, &mut found)?;
        } else {
            found.insert(path.clone());
        }
    }
    debug!("Discovered {} input files", found.len());
    Ok(found.into_iter().collect())
}

fn walk_dir(dir: &Path, found: &mut IndexSet<PathBuf>) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {:?}", dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    for entry in entries {
        if entry.is_dir() {
            walk_dir(&entry, found)?;
        } else if is_supported(&entry) {
            found.insert(entry);
        }
    }
    Ok(())
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.iter().any(|s| e.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchEvent;
    use crate::config::LoaderSettings;
    use crate::storage::profiles::{Profile, RoiRegion};
    use crate::vision::ocr::tests::FakeBackend;
    use crate::vision::RatioRect;
    use image::{ImageFormat, Rgb, RgbImage};
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_discover_files_walks_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("b.PNG"));
        touch(&root.join("a.pdf"));
        touch(&root.join("notes.txt"));
        touch(&root.join("sub/c.jpeg"));
        touch(&root.join("sub/deeper/d.bmp"));

        let explicit = root.join("notes.txt");
        let inputs = [root.to_path_buf(), explicit.clone(), root.join("a.pdf")];
        let files = discover_files(&inputs).unwrap();

        assert_eq!(
            files,
            vec![
                root.join("a.pdf"),
                root.join("b.PNG"),
                root.join("sub/c.jpeg"),
                root.join("sub/deeper/d.bmp"),
                explicit,
            ]
        );
    }

    #[test]
    fn test_missing_backend_fails_fast() {
        let mut config = AppConfig::default();
        config.ocr.tesseract_cmd = "/nonexistent/bin/tesseract-formscan".to_string();
        assert!(FormscanApp::new(config, ProfileStore::default()).is_err());
    }

    #[test]
    fn test_start_batch_uses_snapshot() {
        let dir = TempDir::new().unwrap();
        let scan = dir.path().join("receipt_7.png");
        RgbImage::from_pixel(100, 200, Rgb([255, 255, 255]))
            .save_with_format(&scan, ImageFormat::Png)
            .unwrap();

        let mut store = ProfileStore::default();
        store
            .insert(
                "Receipt",
                Profile {
                    keywords: vec!["receipt".to_string()],
                    rois: vec![RoiRegion::new(
                        "amount",
                        RatioRect { x: 0.5, y: 0.5, w: 0.2, h: 0.1 },
                    )],
                    reference_width: 100,
                    reference_height: 200,
                    ..Profile::default()
                },
            )
            .unwrap();

        let app = FormscanApp::with_backend(
            AppConfig::default(),
            store,
            Arc::new(FakeBackend::answering(" 4 2 ")),
            Arc::new(ImageLoader::new(LoaderSettings::default())),
        );

        let handle = app.start_batch(BatchRequest {
            files: vec![scan.clone()],
            forced_profile: None,
        });
        // Edits after the start do not reach the running batch
        app.profiles().write().delete("Receipt").unwrap();

        let results = handle.join().unwrap();
        assert_eq!(results["Receipt"][0].fields["amount"], "42");
        assert_eq!(results["Receipt"][0].full_path, scan);
    }

    #[test]
    fn test_read_region_clamps_to_page() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("page.png");
        RgbImage::from_pixel(100, 200, Rgb([255, 255, 255]))
            .save_with_format(&page, ImageFormat::Png)
            .unwrap();

        let backend = Arc::new(FakeBackend::answering(" 4 2 "));
        let app = FormscanApp::with_backend(
            AppConfig::default(),
            ProfileStore::default(),
            backend.clone(),
            Arc::new(ImageLoader::new(LoaderSettings::default())),
        );

        assert_eq!(app.read_region(&page, None, [-10, -10, 50, 20]).unwrap(), "42");
        // Blank pages cannot be aligned; the region is read from the page as is
        assert_eq!(app.read_region(&page, Some(&page), [90, 190, 50, 50]).unwrap(), "42");
        assert_eq!(*backend.seen.lock(), vec![(150, 60), (30, 30)]);
    }

    #[test]
    fn test_read_region_missing_page() {
        let app = FormscanApp::with_backend(
            AppConfig::default(),
            ProfileStore::default(),
            Arc::new(FakeBackend::answering("")),
            Arc::new(ImageLoader::new(LoaderSettings::default())),
        );
        assert!(app.read_region(Path::new("/nonexistent/page.png"), None, [0, 0, 1, 1]).is_err());
    }

    #[test]
    fn test_handle_events_end_with_terminal() {
        let app = FormscanApp::with_backend(
            AppConfig::default(),
            ProfileStore::default(),
            Arc::new(FakeBackend::answering("")),
            Arc::new(ImageLoader::new(LoaderSettings::default())),
        );

        let handle = app.start_batch(BatchRequest {
            files: vec![PathBuf::from("/nonexistent/a.png")],
            forced_profile: None,
        });
        let events: Vec<BatchEvent> = handle.events.iter().collect();

        assert!(matches!(events.last(), Some(BatchEvent::Completed(r)) if r.is_empty()));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
}
