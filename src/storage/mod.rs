//! Storage Layer
//!
//! Handles persistence of the profile catalog and application directories.

pub mod profiles;

use anyhow::Result;
use std::path::PathBuf;

pub use profiles::{ImportOutcome, ProfileStore, RoiDraft};

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "formscan", "formscan")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Default location of the profile catalog
pub fn default_profiles_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("profiles.json"))
}
