//! Document profile storage and loading
//!
//! A profile names a document layout: the filename keywords that select it and
//! the ordered regions to read from it. The catalog is kept in insertion order
//! because automatic matching is first-match-wins over that order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{FormscanError, Result};
use crate::vision::geometry::{RatioRect, RoiInput};

/// Format version written into export envelopes
pub const EXPORT_VERSION: &str = "1.0";

/// Suffix appended to imported profiles whose name already exists
pub const IMPORT_SUFFIX: &str = "_(Imported)";

/// Ordered profile catalog keyed by profile name
pub type ProfileCatalog = IndexMap<String, Profile>;

/// A region to read, as fractions of the reference image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiRegion {
    /// Output field key
    pub col_name: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl RoiRegion {
    pub fn new(col_name: impl Into<String>, bounds: RatioRect) -> Self {
        Self {
            col_name: col_name.into(),
            x: bounds.x,
            y: bounds.y,
            w: bounds.w,
            h: bounds.h,
        }
    }

    /// Region bounds in ratio space
    pub fn bounds(&self) -> RatioRect {
        RatioRect {
            x: self.x,
            y: self.y,
            w: self.w,
            h: self.h,
        }
    }
}

/// A region as drawn by a profile author, before conversion to ratios
#[derive(Debug, Clone, PartialEq)]
pub struct RoiDraft {
    pub col_name: String,
    pub bounds: RoiInput,
}

/// A document profile definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Filename keywords for automatic matching
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regions to read, in output column order
    #[serde(default)]
    pub rois: Vec<RoiRegion>,
    /// Width of the image the regions were authored on
    #[serde(rename = "ref_w", default)]
    pub reference_width: u32,
    /// Height of the image the regions were authored on
    #[serde(rename = "ref_h", default)]
    pub reference_height: u32,
    /// Image shown while editing the profile
    #[serde(default)]
    pub sample_image_path: String,
    /// Blank form used as the registration reference
    #[serde(default)]
    pub template_path: Option<PathBuf>,
}

impl Profile {
    /// True if any non-empty keyword is a literal, case-sensitive substring of `filename`
    pub fn matches(&self, filename: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && filename.contains(k.as_str()))
    }

    /// Registration template, ignoring the empty string older catalogs store
    pub fn template(&self) -> Option<&Path> {
        self.template_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Check the reference-size invariant
    pub fn validate(&self, name: &str) -> Result<()> {
        if !self.rois.is_empty() && (self.reference_width == 0 || self.reference_height == 0) {
            return Err(FormscanError::InvalidProfile {
                name: name.to_string(),
                reason: "regions require a positive reference width and height".to_string(),
            });
        }
        Ok(())
    }
}

/// Split a comma-separated keyword string, trimming and dropping blanks and duplicates
pub fn parse_keywords(text: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for k in text.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        if !keywords.iter().any(|existing| existing == k) {
            keywords.push(k.to_string());
        }
    }
    keywords
}

/// Export/import file envelope
#[derive(Debug, Serialize, Deserialize)]
struct CatalogEnvelope {
    #[serde(default = "default_version")]
    version: String,
    #[serde(rename = "type", default = "default_import_type")]
    kind: String,
    #[serde(default)]
    profiles: ProfileCatalog,
}

fn default_version() -> String {
    EXPORT_VERSION.to_string()
}

fn default_import_type() -> String {
    "single".to_string()
}

/// Result of importing an export file
#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    /// Catalog replaced by a full export; carries the new profile count
    Replaced(usize),
    /// Profiles merged in under these (possibly renamed) names
    Merged(Vec<String>),
}

/// Persisted, ordered catalog of profiles
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    path: Option<PathBuf>,
    profiles: ProfileCatalog,
}

impl ProfileStore {
    /// Open the catalog at `path`. A missing or unreadable file yields an empty catalog.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut store = Self {
            path: Some(path.into()),
            profiles: ProfileCatalog::new(),
        };
        store.load();
        store
    }

    /// Re-read the catalog from disk
    pub fn load(&mut self) {
        let Some(path) = &self.path else {
            return;
        };

        if !path.exists() {
            debug!("No profile catalog at {:?}, starting empty", path);
            self.profiles.clear();
            return;
        }

        match std::fs::read_to_string(path)
            .map_err(FormscanError::from)
            .and_then(|s| serde_json::from_str::<ProfileCatalog>(&s).map_err(FormscanError::from))
        {
            Ok(mut profiles) => {
                profiles.retain(|name, profile| match profile.validate(name) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Dropping profile from {:?}: {}", path, e);
                        false
                    }
                });
                info!("Loaded {} profiles from {:?}", profiles.len(), path);
                self.profiles = profiles;
            }
            Err(e) => {
                warn!("Failed to load profiles from {:?}: {}", path, e);
                self.profiles.clear();
            }
        }
    }

    /// Write the catalog to its backing file
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        write_json(path, &self.profiles)?;
        debug!("Saved {} profiles to {:?}", self.profiles.len(), path);
        Ok(())
    }

    /// Profile names in catalog order
    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Consistent copy of the catalog for a batch run
    pub fn snapshot(&self) -> ProfileCatalog {
        self.profiles.clone()
    }

    /// Create or replace a profile from authored regions.
    ///
    /// Pixel regions are converted to ratios against the reference size;
    /// ratio regions are stored as given.
    #[allow(clippy::too_many_arguments)]
    pub fn add_profile(
        &mut self,
        name: &str,
        keywords: Vec<String>,
        drafts: Vec<RoiDraft>,
        reference_width: u32,
        reference_height: u32,
        sample_image_path: &str,
        template_path: Option<PathBuf>,
    ) -> Result<()> {
        if !drafts.is_empty() && (reference_width == 0 || reference_height == 0) {
            return Err(FormscanError::InvalidProfile {
                name: name.to_string(),
                reason: "cannot store regions without a reference resolution".to_string(),
            });
        }

        let rois = drafts
            .into_iter()
            .map(|d| {
                let bounds = d.bounds.into_ratio(reference_width, reference_height);
                RoiRegion::new(d.col_name, bounds)
            })
            .collect();

        let profile = Profile {
            keywords: parse_keywords(&keywords.join(",")),
            rois,
            reference_width,
            reference_height,
            sample_image_path: sample_image_path.to_string(),
            template_path,
        };

        self.insert(name, profile)
    }

    /// Insert a prepared profile, keeping the position of an existing entry
    pub fn insert(&mut self, name: &str, profile: Profile) -> Result<()> {
        profile.validate(name)?;
        self.profiles.insert(name.to_string(), profile);
        info!("Stored profile '{}'", name);
        self.save()
    }

    /// Remove a profile. Returns false if no such profile exists.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        if self.profiles.shift_remove(name).is_none() {
            return Ok(false);
        }
        info!("Deleted profile '{}'", name);
        self.save()?;
        Ok(true)
    }

    /// Put the listed profiles first, in the given order. Unknown names are
    /// ignored; unlisted profiles keep their relative order after them.
    pub fn reorder(&mut self, order: &[String]) -> Result<()> {
        let mut reordered = ProfileCatalog::with_capacity(self.profiles.len());
        for name in order {
            if let Some(profile) = self.profiles.get(name) {
                reordered.insert(name.clone(), profile.clone());
            }
        }
        for (name, profile) in &self.profiles {
            if !reordered.contains_key(name) {
                reordered.insert(name.clone(), profile.clone());
            }
        }
        self.profiles = reordered;
        self.save()
    }

    /// Export the whole catalog as a "full" envelope
    pub fn export_all(&self, path: &Path) -> Result<()> {
        let envelope = CatalogEnvelope {
            version: EXPORT_VERSION.to_string(),
            kind: "full".to_string(),
            profiles: self.profiles.clone(),
        };
        write_json(path, &envelope)?;
        info!("Exported {} profiles to {:?}", self.profiles.len(), path);
        Ok(())
    }

    /// Export one profile as a "single" envelope
    pub fn export_profile(&self, name: &str, path: &Path) -> Result<()> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| FormscanError::ProfileNotFound(name.to_string()))?;

        let mut profiles = ProfileCatalog::new();
        profiles.insert(name.to_string(), profile.clone());

        let envelope = CatalogEnvelope {
            version: EXPORT_VERSION.to_string(),
            kind: "single".to_string(),
            profiles,
        };
        write_json(path, &envelope)?;
        info!("Exported profile '{}' to {:?}", name, path);
        Ok(())
    }

    /// Import an export file.
    ///
    /// A "full" file replaces the catalog. Anything else merges; an incoming
    /// name that collides gets [`IMPORT_SUFFIX`] appended until it is unique,
    /// so existing profiles are never overwritten.
    pub fn import(&mut self, path: &Path) -> Result<ImportOutcome> {
        let content = std::fs::read_to_string(path)?;
        let envelope: CatalogEnvelope = serde_json::from_str(&content)?;
        for (name, profile) in &envelope.profiles {
            profile.validate(name)?;
        }

        if envelope.kind == "full" {
            self.profiles = envelope.profiles;
            self.save()?;
            info!("Replaced catalog with {} imported profiles", self.profiles.len());
            return Ok(ImportOutcome::Replaced(self.profiles.len()));
        }

        let mut imported = Vec::with_capacity(envelope.profiles.len());
        for (name, profile) in envelope.profiles {
            let mut final_name = name;
            while self.profiles.contains_key(&final_name) {
                final_name.push_str(IMPORT_SUFFIX);
            }
            self.profiles.insert(final_name.clone(), profile);
            imported.push(final_name);
        }

        self.save()?;
        info!("Merged {} imported profiles", imported.len());
        Ok(ImportOutcome::Merged(imported))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)?;
    Ok(())
}
