//! Message types sent from the batch worker to its observer

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Extracted fields for one input file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    /// Base name of the input file
    pub filename: String,
    /// Path the file was read from
    pub full_path: PathBuf,
    /// Text per region column, in region order
    pub fields: IndexMap<String, String>,
}

/// Records grouped by profile name, in processing order
pub type ResultSet = IndexMap<String, Vec<ExtractionRecord>>;

/// Severity of a batch log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// File processed
    Info,
    /// No profile matched the file
    Skip,
    /// File dropped after a failure
    Error,
}

/// Messages sent from the batch worker
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// Per-file outcome line
    Log { level: LogLevel, message: String },
    /// Percentage of files processed, never decreasing
    Progress(u8),
    /// Every file was processed
    Completed(ResultSet),
    /// Run stopped on request; carries the files finished so far
    Cancelled(ResultSet),
}

impl BatchEvent {
    /// True for the final event of a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchEvent::Completed(_) | BatchEvent::Cancelled(_))
    }
}
