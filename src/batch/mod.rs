//! Batch extraction
//!
//! Runs a file list through profile resolution, optional registration and
//! per-region OCR on a single background worker. A failing file is logged and
//! dropped; the run carries on. Cancellation is cooperative and checked before
//! each file and before each region.

pub mod events;

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::DynamicImage;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{FormscanError, Result};
use crate::storage::profiles::{Profile, ProfileCatalog};
use crate::vision::geometry::ratio_to_pixel;
use crate::vision::loader::{ImageSource, LoadPurpose};
use crate::vision::ocr::OcrExtractor;
use crate::vision::registration::ImageRegistrar;

pub use events::{BatchEvent, ExtractionRecord, LogLevel, ResultSet};

/// One-way cancellation request shared with the worker
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Files to process and how to pick their profile
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub files: Vec<PathBuf>,
    /// Use this profile for every file instead of keyword matching
    pub forced_profile: Option<String>,
}

/// Profile chosen for a file
#[derive(Debug, PartialEq)]
pub enum Resolution<'a> {
    Matched { name: &'a str, profile: &'a Profile },
    /// No keyword matched; the file is skipped
    NoMatch,
    /// Forced profile is not in the catalog
    MissingForced(String),
}

/// Pick the profile for `filename`.
///
/// A forced name wins outright. Otherwise the first profile in catalog order
/// with a keyword contained in the file name is used.
pub fn resolve_profile<'a>(
    catalog: &'a ProfileCatalog,
    filename: &str,
    forced: Option<&str>,
) -> Resolution<'a> {
    if let Some(forced) = forced {
        return match catalog.get_key_value(forced) {
            Some((name, profile)) => Resolution::Matched {
                name: name.as_str(),
                profile,
            },
            None => Resolution::MissingForced(forced.to_string()),
        };
    }

    catalog
        .iter()
        .find(|(_, profile)| profile.matches(filename))
        .map_or(Resolution::NoMatch, |(name, profile)| Resolution::Matched {
            name: name.as_str(),
            profile,
        })
}

/// Integer percentage of processed files
pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed.min(total) * 100 / total) as u8
}

enum FileOutcome {
    Extracted { profile: String, record: ExtractionRecord },
    Skipped,
    Cancelled,
}

/// Drives one batch run over a snapshot of the profile catalog
pub struct BatchOrchestrator {
    catalog: ProfileCatalog,
    extractor: OcrExtractor,
    source: Arc<dyn ImageSource>,
    registrar: Option<ImageRegistrar>,
    cancel: CancelToken,
    state: BatchState,
}

impl BatchOrchestrator {
    pub fn new(
        catalog: ProfileCatalog,
        extractor: OcrExtractor,
        source: Arc<dyn ImageSource>,
    ) -> Self {
        Self {
            catalog,
            extractor,
            source,
            registrar: None,
            cancel: CancelToken::default(),
            state: BatchState::Idle,
        }
    }

    /// Align scans to their profile's template before reading regions
    pub fn with_registration(mut self, registrar: ImageRegistrar) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Process every file in order, reporting through `events`.
    ///
    /// Returns the records gathered; on cancellation only files that finished
    /// every region are included.
    pub fn run(&mut self, request: &BatchRequest, events: &Sender<BatchEvent>) -> ResultSet {
        self.state = BatchState::Running;
        let total = request.files.len();
        let forced = request.forced_profile.as_deref();
        let mut results = ResultSet::new();
        let mut templates: HashMap<String, Option<DynamicImage>> = HashMap::new();
        let mut cancelled = false;

        info!(
            "Batch started: {} files, {} profiles, backend {}",
            total,
            self.catalog.len(),
            self.extractor.backend_name()
        );

        for (index, path) in request.files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let filename = file_name(path);
            match self.process_file(path, &filename, forced, &mut templates) {
                Ok(FileOutcome::Extracted { profile, record }) => {
                    let message = format!("{filename}: extracted with '{profile}'");
                    emit_log(events, LogLevel::Info, message);
                    results.entry(profile).or_default().push(record);
                }
                Ok(FileOutcome::Skipped) => {
                    let message = format!("{filename}: no matching profile, skipped");
                    emit_log(events, LogLevel::Skip, message);
                }
                Ok(FileOutcome::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    emit_log(events, LogLevel::Error, format!("{filename}: {e}"));
                }
            }

            let _ = events.send(BatchEvent::Progress(progress_percent(index + 1, total)));
        }

        let processed: usize = results.values().map(Vec::len).sum();
        if cancelled {
            self.state = BatchState::Cancelled;
            info!("Batch cancelled after {} extracted files", processed);
            let _ = events.send(BatchEvent::Cancelled(results.clone()));
        } else {
            self.state = BatchState::Completed;
            info!("Batch completed: {} of {} files extracted", processed, total);
            let _ = events.send(BatchEvent::Completed(results.clone()));
        }
        results
    }

    /// Run on a background worker thread
    pub fn spawn(mut self, request: BatchRequest) -> BatchHandle {
        let (tx, rx) = unbounded();
        let cancel = self.cancel_token();

        let worker = std::thread::spawn(move || {
            info!("Batch worker starting...");
            let results = self.run(&request, &tx);
            info!("Batch worker exiting ({:?})", self.state());
            results
        });

        BatchHandle {
            events: rx,
            cancel,
            worker: Some(worker),
        }
    }

    fn process_file(
        &self,
        path: &Path,
        filename: &str,
        forced: Option<&str>,
        templates: &mut HashMap<String, Option<DynamicImage>>,
    ) -> Result<FileOutcome> {
        let (name, profile) = match resolve_profile(&self.catalog, filename, forced) {
            Resolution::Matched { name, profile } => (name, profile),
            Resolution::NoMatch => return Ok(FileOutcome::Skipped),
            Resolution::MissingForced(name) => return Err(FormscanError::ProfileNotFound(name)),
        };

        let image = self
            .source
            .load(path, LoadPurpose::Extraction)
            .ok_or_else(|| FormscanError::Decode {
                path: path.to_path_buf(),
            })?;
        let image = self.register(name, profile, image, templates);

        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(FormscanError::Decode {
                path: path.to_path_buf(),
            });
        }

        let mut fields = IndexMap::with_capacity(profile.rois.len());
        for roi in &profile.rois {
            if self.cancel.is_cancelled() {
                return Ok(FileOutcome::Cancelled);
            }
            let rect = ratio_to_pixel(&roi.bounds(), width, height);
            let text = self.extractor.extract_rect(&image, rect)?;
            fields.insert(roi.col_name.clone(), text);
        }

        Ok(FileOutcome::Extracted {
            profile: name.to_string(),
            record: ExtractionRecord {
                filename: filename.to_string(),
                full_path: path.to_path_buf(),
                fields,
            },
        })
    }

    /// Align to the profile template when registration is on and one is set
    fn register(
        &self,
        name: &str,
        profile: &Profile,
        image: DynamicImage,
        templates: &mut HashMap<String, Option<DynamicImage>>,
    ) -> DynamicImage {
        let (Some(registrar), Some(template_path)) = (&self.registrar, profile.template()) else {
            return image;
        };

        let template = templates.entry(name.to_string()).or_insert_with(|| {
            let loaded = self.source.load(template_path, LoadPurpose::Extraction);
            if loaded.is_none() {
                warn!("Cannot load template {:?} for profile '{}'", template_path, name);
            }
            loaded
        });

        let Some(template) = template else {
            return image;
        };
        let outcome = registrar.align(image, template);
        if !outcome.is_registered() {
            debug!("Reading regions of a '{}' page without alignment", name);
        }
        outcome.into_image()
    }
}

/// Observer side of a running batch
pub struct BatchHandle {
    pub events: Receiver<BatchEvent>,
    cancel: CancelToken,
    worker: Option<JoinHandle<ResultSet>>,
}

impl BatchHandle {
    /// Token that stops the worker at its next checkpoint when cancelled.
    /// Can be moved to another thread, such as a signal listener.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the worker and take its results
    pub fn join(mut self) -> Result<ResultSet> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| FormscanError::Extraction("batch worker panicked".to_string())),
            None => Ok(ResultSet::new()),
        }
    }
}

fn emit_log(events: &Sender<BatchEvent>, level: LogLevel, message: String) {
    match level {
        LogLevel::Info => info!("{}", message),
        LogLevel::Skip => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
    let _ = events.send(BatchEvent::Log { level, message });
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OcrSettings;
    use crate::storage::profiles::RoiRegion;
    use crate::vision::geometry::RatioRect;
    use crate::vision::ocr::tests::FakeBackend;
    use crate::vision::ocr::OcrBackend;
    use image::{GrayImage, Rgb, RgbImage};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Image source serving pages from memory and recording every load
    #[derive(Default)]
    struct MemorySource {
        pages: HashMap<PathBuf, DynamicImage>,
        loads: Mutex<Vec<PathBuf>>,
    }

    impl MemorySource {
        fn with_pages(names: &[&str], w: u32, h: u32) -> Self {
            let pages = names
                .iter()
                .map(|n| {
                    let page = RgbImage::from_pixel(w, h, Rgb([250, 250, 250]));
                    let page = DynamicImage::ImageRgb8(page);
                    (PathBuf::from(n), page)
                })
                .collect();
            Self {
                pages,
                loads: Mutex::new(Vec::new()),
            }
        }
    }

    impl ImageSource for MemorySource {
        fn load(&self, path: &Path, _purpose: LoadPurpose) -> Option<DynamicImage> {
            self.loads.lock().push(path.to_path_buf());
            self.pages.get(path).cloned()
        }
    }

    /// Backend that raises the cancel flag on its n-th call
    struct CancellingBackend {
        calls: AtomicUsize,
        cancel_on: usize,
        token: Mutex<Option<CancelToken>>,
    }

    impl OcrBackend for CancellingBackend {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn recognize_line(&self, _image: &GrayImage) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.cancel_on {
                if let Some(token) = self.token.lock().as_ref() {
                    token.cancel();
                }
            }
            Ok(format!("value {call}"))
        }
    }

    /// Backend that announces each call and waits to be released
    struct GatedBackend {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl OcrBackend for GatedBackend {
        fn name(&self) -> &str {
            "gated"
        }

        fn recognize_line(&self, _image: &GrayImage) -> Result<String> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok("v".to_string())
        }
    }

    fn profile(keywords: &[&str], rois: &[&str]) -> Profile {
        Profile {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            rois: rois
                .iter()
                .map(|c| RoiRegion::new(*c, RatioRect { x: 0.5, y: 0.5, w: 0.2, h: 0.1 }))
                .collect(),
            reference_width: 1000,
            reference_height: 2000,
            ..Profile::default()
        }
    }

    fn catalog(entries: Vec<(&str, Profile)>) -> ProfileCatalog {
        entries.into_iter().map(|(n, p)| (n.to_string(), p)).collect()
    }

    fn request(files: &[&str]) -> BatchRequest {
        BatchRequest {
            files: files.iter().map(PathBuf::from).collect(),
            forced_profile: None,
        }
    }

    fn orchestrator(
        catalog: ProfileCatalog,
        backend: Arc<dyn OcrBackend>,
        source: Arc<MemorySource>,
    ) -> BatchOrchestrator {
        let extractor = OcrExtractor::new(backend, &OcrSettings::default());
        BatchOrchestrator::new(catalog, extractor, source)
    }

    fn drain(rx: &Receiver<BatchEvent>) -> Vec<BatchEvent> {
        rx.try_iter().collect()
    }

    fn progress_values(events: &[BatchEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    fn log_levels(events: &[BatchEvent]) -> Vec<LogLevel> {
        events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Log { level, .. } => Some(*level),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_resolve_first_match_in_catalog_order() {
        let catalog = catalog(vec![("P1", profile(&["a"], &[])), ("P2", profile(&["ab"], &[]))]);

        match resolve_profile(&catalog, "ab_scan.png", None) {
            Resolution::Matched { name, .. } => assert_eq!(name, "P1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(resolve_profile(&catalog, "zzz.png", None), Resolution::NoMatch);
    }

    #[test]
    fn test_resolve_forced_ignores_filename() {
        let catalog = catalog(vec![("P1", profile(&["a"], &[])), ("P2", profile(&["ab"], &[]))]);

        match resolve_profile(&catalog, "nothing_matches.png", Some("P2")) {
            Resolution::Matched { name, .. } => assert_eq!(name, "P2"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            resolve_profile(&catalog, "a.png", Some("Gone")),
            Resolution::MissingForced("Gone".to_string())
        );
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 66);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn test_end_to_end_receipt() {
        let backend = Arc::new(FakeBackend::answering("1 2,345"));
        let source = Arc::new(MemorySource::with_pages(&["scans/receipt_001.png"], 1000, 2000));
        let catalog = catalog(vec![("Receipt", profile(&["receipt"], &["amount"]))]);
        let mut batch = orchestrator(catalog, backend.clone(), source);
        let (tx, rx) = unbounded();

        let results = batch.run(&request(&["scans/receipt_001.png"]), &tx);

        let record = &results["Receipt"][0];
        assert_eq!(record.filename, "receipt_001.png");
        assert_eq!(record.full_path, PathBuf::from("scans/receipt_001.png"));
        assert_eq!(record.fields["amount"], "12,345");
        // 200x200 crop upscaled 3x
        assert_eq!(backend.seen.lock().as_slice(), &[(600, 600)]);
        assert_eq!(batch.state(), BatchState::Completed);

        let events = drain(&rx);
        assert!(matches!(events.last(), Some(BatchEvent::Completed(r)) if r == &results));
    }

    #[test]
    fn test_skip_and_failure_are_isolated() {
        let backend = Arc::new(FakeBackend::answering("ok"));
        // "form_missing.png" is not served, so it fails to decode
        let source = Arc::new(MemorySource::with_pages(&["form_1.png", "form_3.png"], 100, 100));
        let catalog = catalog(vec![("Form", profile(&["form"], &["a", "b"]))]);
        let mut batch = orchestrator(catalog, backend, source);
        let (tx, rx) = unbounded();

        let files = ["form_1.png", "other.png", "form_missing.png", "form_3.png"];
        let results = batch.run(&request(&files), &tx);

        let names: Vec<&str> = results["Form"].iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["form_1.png", "form_3.png"]);
        assert_eq!(results["Form"][0].fields.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        let events = drain(&rx);
        assert_eq!(
            log_levels(&events),
            vec![LogLevel::Info, LogLevel::Skip, LogLevel::Error, LogLevel::Info]
        );
        assert_eq!(progress_values(&events), vec![25, 50, 75, 100]);
        assert!(matches!(events.last(), Some(BatchEvent::Completed(_))));
    }

    #[test]
    fn test_extraction_error_drops_file() {
        let backend = Arc::new(FakeBackend {
            fail: true,
            ..FakeBackend::answering("")
        });
        let source = Arc::new(MemorySource::with_pages(&["form_1.png"], 50, 50));
        let catalog = catalog(vec![("Form", profile(&["form"], &["a"]))]);
        let mut batch = orchestrator(catalog, backend, source);
        let (tx, rx) = unbounded();

        let results = batch.run(&request(&["form_1.png"]), &tx);

        assert!(results.is_empty());
        assert_eq!(log_levels(&drain(&rx)), vec![LogLevel::Error]);
    }

    #[test]
    fn test_forced_profile_applies_to_every_file() {
        let backend = Arc::new(FakeBackend::answering("v"));
        let source = Arc::new(MemorySource::with_pages(&["x.png", "y.png"], 40, 40));
        let catalog = catalog(vec![
            ("Auto", profile(&["x"], &["a"])),
            ("Manual", profile(&["nothing"], &["m"])),
        ]);
        let mut batch = orchestrator(catalog, backend, source);
        let (tx, _rx) = unbounded();

        let results = batch.run(
            &BatchRequest {
                files: vec![PathBuf::from("x.png"), PathBuf::from("y.png")],
                forced_profile: Some("Manual".to_string()),
            },
            &tx,
        );

        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["Manual"]);
        assert_eq!(results["Manual"].len(), 2);
    }

    #[test]
    fn test_missing_forced_profile_is_per_file_error() {
        let backend = Arc::new(FakeBackend::answering("v"));
        let source = Arc::new(MemorySource::with_pages(&["x.png"], 40, 40));
        let mut batch = orchestrator(catalog(vec![]), backend, source.clone());
        let (tx, rx) = unbounded();

        let results = batch.run(
            &BatchRequest {
                files: vec![PathBuf::from("x.png"), PathBuf::from("x.png")],
                forced_profile: Some("Gone".to_string()),
            },
            &tx,
        );

        assert!(results.is_empty());
        let events = drain(&rx);
        assert_eq!(log_levels(&events), vec![LogLevel::Error, LogLevel::Error]);
        assert!(matches!(events.last(), Some(BatchEvent::Completed(_))));
        assert!(source.loads.lock().is_empty());
    }

    #[test]
    fn test_cancel_keeps_finished_files() {
        let backend = Arc::new(CancellingBackend {
            calls: AtomicUsize::new(0),
            cancel_on: 2,
            token: Mutex::new(None),
        });
        let files = ["f1.png", "f2.png", "f3.png", "f4.png"];
        let source = Arc::new(MemorySource::with_pages(&files, 30, 30));
        let catalog = catalog(vec![("F", profile(&["f"], &["only"]))]);
        let mut batch = orchestrator(catalog, backend.clone(), source.clone());
        *backend.token.lock() = Some(batch.cancel_token());
        let (tx, rx) = unbounded();

        let results = batch.run(&request(&files), &tx);

        // File 2 finished its only region before the flag was seen
        assert_eq!(results["F"].len(), 2);
        assert_eq!(source.loads.lock().len(), 2);
        assert_eq!(batch.state(), BatchState::Cancelled);

        let events = drain(&rx);
        assert!(matches!(events.last(), Some(BatchEvent::Cancelled(r)) if r["F"].len() == 2));
        assert!(!events.iter().any(|e| matches!(e, BatchEvent::Completed(_))));
    }

    #[test]
    fn test_cancel_mid_file_drops_partial_record() {
        let backend = Arc::new(CancellingBackend {
            calls: AtomicUsize::new(0),
            cancel_on: 1,
            token: Mutex::new(None),
        });
        let source = Arc::new(MemorySource::with_pages(&["f1.png", "f2.png"], 30, 30));
        let catalog = catalog(vec![("F", profile(&["f"], &["first", "second"]))]);
        let mut batch = orchestrator(catalog, backend.clone(), source.clone());
        *backend.token.lock() = Some(batch.cancel_token());
        let (tx, rx) = unbounded();

        let results = batch.run(&request(&["f1.png", "f2.png"]), &tx);

        assert!(results.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.loads.lock().len(), 1);
        assert!(matches!(drain(&rx).last(), Some(BatchEvent::Cancelled(r)) if r.is_empty()));
    }

    #[test]
    fn test_spawned_worker_reports_monotonic_progress() {
        let backend = Arc::new(FakeBackend::answering("v"));
        let files: Vec<String> = (0..7).map(|i| format!("doc_{i}.png")).collect();
        let names: Vec<&str> = files.iter().map(String::as_str).collect();
        let source = Arc::new(MemorySource::with_pages(&names, 20, 20));
        let catalog = catalog(vec![("Doc", profile(&["doc"], &["a"]))]);
        let batch = orchestrator(catalog, backend, source);

        let handle = batch.spawn(request(&names));
        let mut progress = Vec::new();
        let mut terminal = None;
        for event in handle.events.iter() {
            match event {
                BatchEvent::Progress(p) => progress.push(p),
                e if e.is_terminal() => {
                    terminal = Some(e);
                    break;
                }
                _ => {}
            }
        }
        let results = handle.join().unwrap();

        assert_eq!(progress.len(), 7);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));
        assert!(matches!(terminal, Some(BatchEvent::Completed(_))));
        assert_eq!(results["Doc"].len(), 7);
    }

    #[test]
    fn test_handle_token_cancels_running_worker() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let backend = Arc::new(GatedBackend {
            entered: entered_tx,
            release: release_rx,
        });
        let names = ["doc_1.png", "doc_2.png", "doc_3.png"];
        let source = Arc::new(MemorySource::with_pages(&names, 20, 20));
        let catalog = catalog(vec![("Doc", profile(&["doc"], &["a"]))]);
        let batch = orchestrator(catalog, backend, source);

        let handle = batch.spawn(request(&names));
        let token = handle.cancel_token();
        entered_rx.recv().unwrap();
        std::thread::spawn(move || token.cancel()).join().unwrap();
        release_tx.send(()).unwrap();

        let events: Vec<BatchEvent> = handle.events.iter().collect();
        let results = handle.join().unwrap();

        match events.last() {
            Some(BatchEvent::Cancelled(partial)) => assert_eq!(partial, &results),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(results["Doc"].len(), 1);
        assert_eq!(results["Doc"][0].filename, "doc_1.png");
        assert!(entered_rx.try_recv().is_err());
    }

    #[test]
    fn test_registration_without_template_is_noop() {
        let backend = Arc::new(FakeBackend::answering("v"));
        let source = Arc::new(MemorySource::with_pages(&["r.png"], 64, 48));
        let catalog = catalog(vec![("R", profile(&["r"], &["a"]))]);
        let mut batch = orchestrator(catalog, backend.clone(), source.clone())
            .with_registration(ImageRegistrar::default());
        let (tx, _rx) = unbounded();

        batch.run(&request(&["r.png"]), &tx);

        // Only the scan was loaded; no template lookup happened
        assert_eq!(source.loads.lock().as_slice(), &[PathBuf::from("r.png")]);
        assert_eq!(backend.seen.lock().len(), 1);
    }

    #[test]
    fn test_unloadable_template_falls_back_once() {
        let backend = Arc::new(FakeBackend::answering("v"));
        let source = Arc::new(MemorySource::with_pages(&["r1.png", "r2.png"], 64, 48));
        let mut with_template = profile(&["r"], &["a"]);
        with_template.template_path = Some(PathBuf::from("missing_template.png"));
        let mut batch = orchestrator(catalog(vec![("R", with_template)]), backend, source.clone())
            .with_registration(ImageRegistrar::default());
        let (tx, _rx) = unbounded();

        let results = batch.run(&request(&["r1.png", "r2.png"]), &tx);

        assert_eq!(results["R"].len(), 2);
        let template_loads = source
            .loads
            .lock()
            .iter()
            .filter(|p| p.as_path() == Path::new("missing_template.png"))
            .count();
        assert_eq!(template_loads, 1);
    }
}
