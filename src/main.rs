//! formscan - Template-driven field extraction from scanned documents
//!
//! Applies resolution-independent region profiles to scans and photos,
//! optionally aligning each page to a template first, and reads every region
//! with OCR. Batches tolerate per-file failures.

mod app;
mod batch;
mod config;
mod error;
mod export;
mod storage;
mod vision;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::app::{discover_files, FormscanApp};
use crate::batch::{BatchEvent, BatchHandle, BatchRequest, CancelToken, LogLevel, ResultSet};
use crate::config::AppConfig;
use crate::storage::{ImportOutcome, ProfileStore, RoiDraft};
use crate::vision::{ImageLoader, ImageSource, LoadPurpose, RatioRect, RoiInput};

/// formscan - extract fields from scanned forms with reusable region profiles
#[derive(Parser, Debug)]
#[command(name = "formscan", version)]
#[command(about = "Extract text fields from scanned documents using region profiles")]
struct Args {
    /// Configuration file (defaults to config.toml in the config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Profile catalog file (overrides the configured location)
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "formscan=trace" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract fields from files and directories
    Run {
        /// Input files or directories (walked recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Use this profile for every file instead of keyword matching
        #[arg(short, long)]
        profile: Option<String>,

        /// Write results as CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Write results as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Read a single region of a page, to check a region before saving it
    Ocr {
        file: PathBuf,

        /// Region in page pixels, clamped to the page
        #[arg(
            long,
            value_name = "X,Y,W,H",
            value_parser = parse_rect,
            allow_hyphen_values = true
        )]
        rect: PageRect,

        /// Align the page to this blank form first
        #[arg(long)]
        template: Option<PathBuf>,
    },

    /// Manage the profile catalog
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Write the effective configuration as TOML
    Config {
        /// Destination (defaults to config.toml in the config directory)
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// List profiles in matching order
    List,
    /// Print one profile as JSON
    Show { name: String },
    /// Create a profile, or replace one with the same name
    Add {
        name: String,

        /// Size of the image the regions were drawn on
        #[arg(long = "ref", value_name = "WxH", value_parser = parse_size)]
        reference: Option<RefSize>,

        /// Sample page; its preview size is the reference size unless --ref is given
        #[arg(long)]
        sample: Option<PathBuf>,

        /// Comma-separated filename keywords
        #[arg(long, default_value = "")]
        keywords: String,

        /// Region to read, repeatable
        #[arg(long = "roi", value_name = "NAME:X,Y,W,H", value_parser = parse_roi)]
        rois: Vec<RoiArg>,

        /// Region coordinates are reference pixels instead of ratios
        #[arg(long)]
        pixels: bool,

        /// Blank form used for registration
        #[arg(long)]
        template: Option<PathBuf>,
    },
    /// Delete a profile
    Delete { name: String },
    /// Export the catalog, or a single profile with --name
    Export {
        output: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Import an export file (full exports replace the catalog)
    Import { file: PathBuf },
    /// Move the named profiles to the front, in the given order
    Reorder {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

/// Reference image size given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RefSize {
    width: u32,
    height: u32,
}

/// Named region given on the command line, in the space chosen by --pixels
#[derive(Debug, Clone, PartialEq)]
struct RoiArg {
    name: String,
    bounds: [f64; 4],
}

impl RoiArg {
    fn into_draft(self, pixels: bool) -> RoiDraft {
        let [x, y, w, h] = self.bounds;
        let bounds = if pixels {
            RoiInput::Pixels { x, y, w, h }
        } else {
            RoiInput::Ratio(RatioRect { x, y, w, h })
        };
        RoiDraft {
            col_name: self.name,
            bounds,
        }
    }
}

/// Page rectangle in pixels; may reach past the page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageRect([i64; 4]);

fn parse_size(text: &str) -> std::result::Result<RefSize, String> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{text}'"))?;
    let width = w.trim().parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    let height = h.trim().parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    Ok(RefSize { width, height })
}

fn parse_numbers<T: std::str::FromStr>(text: &str) -> std::result::Result<[T; 4], String>
where
    T::Err: std::fmt::Display,
{
    let values = text
        .split(',')
        .map(str::trim)
        .map(|v| v.parse::<T>().map_err(|e| format!("bad number '{v}': {e}")))
        .collect::<std::result::Result<Vec<T>, String>>()?;
    <[T; 4]>::try_from(values).map_err(|v| format!("expected 4 numbers, got {}", v.len()))
}

fn parse_roi(text: &str) -> std::result::Result<RoiArg, String> {
    let (name, numbers) = text
        .rsplit_once(':')
        .ok_or_else(|| format!("expected NAME:X,Y,W,H, got '{text}'"))?;
    if name.trim().is_empty() {
        return Err("region name is empty".to_string());
    }
    Ok(RoiArg {
        name: name.trim().to_string(),
        bounds: parse_numbers(numbers)?,
    })
}

fn parse_rect(text: &str) -> std::result::Result<PageRect, String> {
    parse_numbers(text).map(PageRect)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    let config = load_or_create_config(args.config.as_deref())?;
    let profiles = args.profiles;

    match args.command {
        Command::Run {
            paths,
            profile,
            csv,
            json,
        } => {
            let store = open_store(profiles, &config)?;
            run_batch(config, store, &paths, profile, csv.as_deref(), json.as_deref())
        }
        Command::Ocr {
            file,
            rect,
            template,
        } => {
            let store = open_store(profiles, &config)?;
            let app = FormscanApp::new(config, store)?;
            println!("{}", app.read_region(&file, template.as_deref(), rect.0)?);
            Ok(())
        }
        Command::Profiles { action } => {
            let store = open_store(profiles, &config)?;
            manage_profiles(store, action, &config)
        }
        Command::Config { output } => write_config(&config, output.as_deref()),
    }
}

/// Open the catalog named on the command line, in the config, or the default one
fn open_store(explicit: Option<PathBuf>, config: &AppConfig) -> Result<ProfileStore> {
    let path = match explicit.or_else(|| config.storage.profiles_path.clone()) {
        Some(path) => path,
        None => storage::default_profiles_path()?,
    };
    Ok(ProfileStore::open(path))
}

/// Install the tracing subscriber
fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("Invalid log filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Load configuration from file or fall back to defaults
fn load_or_create_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return Ok(config);
                }
                Err(e) => warn!("Ignoring unreadable configuration {:?}: {}", config_path, e),
            }
        }
    }
    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn write_config(config: &AppConfig, output: Option<&Path>) -> Result<()> {
    let path = match output {
        Some(path) => path.to_path_buf(),
        None => storage::get_config_dir()?.join("config.toml"),
    };
    config::save_config(config, &path).with_context(|| format!("Failed to write {:?}", path))?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}

/// Cancel the batch on the first Ctrl-C. A second one exits at once.
fn cancel_on_ctrl_c(token: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the signal listener")?;

    std::thread::spawn(move || {
        runtime.block_on(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                return;
            }
            warn!("Interrupted; stopping the batch, press Ctrl-C again to abort");
            token.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
    Ok(())
}

/// Print batch events as they arrive and wait for the terminal one.
/// Returns the results and whether the run was cancelled.
fn collect_outcome(handle: BatchHandle) -> Result<(ResultSet, bool)> {
    let mut outcome: Option<(ResultSet, bool)> = None;
    for event in handle.events.iter() {
        match event {
            BatchEvent::Log { level, message } => {
                let tag = match level {
                    LogLevel::Info => "ok",
                    LogLevel::Skip => "skip",
                    LogLevel::Error => "error",
                };
                println!("[{tag:>5}] {message}");
            }
            BatchEvent::Progress(percent) => eprintln!("progress: {percent}%"),
            BatchEvent::Completed(results) => outcome = Some((results, false)),
            BatchEvent::Cancelled(results) => outcome = Some((results, true)),
        }
    }
    handle.join()?;

    let (results, cancelled) = outcome.context("Batch worker ended without a result")?;
    let extracted: usize = results.values().map(Vec::len).sum();
    if cancelled {
        eprintln!("cancelled: {extracted} files extracted before the stop");
    } else {
        eprintln!("completed: {extracted} files extracted");
    }
    Ok((results, cancelled))
}

fn run_batch(
    config: AppConfig,
    store: ProfileStore,
    paths: &[PathBuf],
    forced_profile: Option<String>,
    csv: Option<&Path>,
    json: Option<&Path>,
) -> Result<()> {
    let files = discover_files(paths)?;
    if files.is_empty() {
        anyhow::bail!("No input files found");
    }
    let app = FormscanApp::new(config, store)?;
    let profile_count = app.profiles().read().len();
    if profile_count == 0 {
        warn!("Profile catalog is empty; every file will be skipped");
    } else {
        debug!("Matching against {} profiles", profile_count);
    }

    let handle = app.start_batch(BatchRequest {
        files,
        forced_profile,
    });
    cancel_on_ctrl_c(handle.cancel_token())?;

    let (results, cancelled) = collect_outcome(handle)?;
    if cancelled {
        warn!("Batch was cancelled; writing partial results");
    }

    if let Some(path) = csv {
        export::export_csv(&results, path).with_context(|| format!("Failed to write {:?}", path))?;
    }
    if let Some(path) = json {
        export::export_json(&results, path).with_context(|| format!("Failed to write {:?}", path))?;
    }
    if csv.is_none() && json.is_none() {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }

    Ok(())
}

fn manage_profiles(
    mut store: ProfileStore,
    action: ProfileAction,
    config: &AppConfig,
) -> Result<()> {
    match action {
        ProfileAction::List => {
            if store.is_empty() {
                println!("No profiles");
            }
            for name in store.names() {
                if let Some(profile) = store.get(&name) {
                    println!(
                        "{name}\tkeywords: [{}]\tregions: {}",
                        profile.keywords.join(", "),
                        profile.rois.len()
                    );
                }
            }
        }
        ProfileAction::Show { name } => {
            let profile = store.get(&name).with_context(|| format!("No profile named '{name}'"))?;
            println!("{}", serde_json::to_string_pretty(profile)?);
        }
        ProfileAction::Add {
            name,
            reference,
            sample,
            keywords,
            rois,
            pixels,
            template,
        } => {
            let reference = match (reference, &sample) {
                (Some(size), _) => size,
                (None, Some(sample)) => {
                    let preview = ImageLoader::new(config.loader.clone())
                        .load(sample, LoadPurpose::Preview)
                        .with_context(|| format!("Cannot load sample {:?}", sample))?;
                    RefSize {
                        width: preview.width(),
                        height: preview.height(),
                    }
                }
                (None, None) => RefSize { width: 0, height: 0 },
            };
            let drafts = rois.into_iter().map(|roi| roi.into_draft(pixels)).collect();
            let sample_path = sample.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();

            store.add_profile(
                &name,
                storage::profiles::parse_keywords(&keywords),
                drafts,
                reference.width,
                reference.height,
                &sample_path,
                template,
            )?;
            println!("Saved '{name}' ({}x{})", reference.width, reference.height);
        }
        ProfileAction::Delete { name } => {
            if !store.delete(&name)? {
                anyhow::bail!("No profile named '{name}'");
            }
            println!("Deleted '{name}'");
        }
        ProfileAction::Export { output, name } => {
            match name {
                Some(name) => store.export_profile(&name, &output)?,
                None => store.export_all(&output)?,
            }
            println!("Exported to {}", output.display());
        }
        ProfileAction::Import { file } => match store.import(&file)? {
            ImportOutcome::Replaced(count) => println!("Replaced catalog with {count} profiles"),
            ImportOutcome::Merged(names) => println!("Imported: {}", names.join(", ")),
        },
        ProfileAction::Reorder { names } => {
            store.reorder(&names)?;
            println!("{}", store.names().join("\n"));
        }
    }
    Ok(())
}
