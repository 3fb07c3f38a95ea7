//! Result export
//!
//! Writes a [`ResultSet`] as CSV (one row per record, one column per distinct
//! field name) or as pretty-printed JSON.

use indexmap::IndexSet;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::batch::ResultSet;
use crate::error::Result;

const FIXED_COLUMNS: [&str; 3] = ["profile", "filename", "full_path"];

/// Distinct field names across all records, in first-seen order
pub fn field_columns(results: &ResultSet) -> Vec<String> {
    let mut columns: IndexSet<&str> = IndexSet::new();
    for record in results.values().flatten() {
        for name in record.fields.keys() {
            columns.insert(name.as_str());
        }
    }
    columns.into_iter().map(str::to_string).collect()
}

/// Write CSV to any writer. Records without a field get an empty cell.
pub fn write_csv<W: Write>(results: &ResultSet, writer: W) -> Result<()> {
    let columns = field_columns(results);
    let mut csv = csv::Writer::from_writer(writer);

    csv.write_record(FIXED_COLUMNS.iter().copied().chain(columns.iter().map(String::as_str)))?;

    for (profile, records) in results {
        for record in records {
            let path = record.full_path.to_string_lossy();
            let mut row: Vec<&str> = vec![profile.as_str(), record.filename.as_str(), &*path];
            row.extend(
                columns
                    .iter()
                    .map(|c| record.fields.get(c).map(String::as_str).unwrap_or("")),
            );
            csv.write_record(&row)?;
        }
    }

    csv.flush()?;
    Ok(())
}

/// Write CSV to a file
pub fn export_csv(results: &ResultSet, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    write_csv(results, file)?;
    info!("Wrote {} records to {:?}", record_count(results), path);
    Ok(())
}

/// Write the whole result set as JSON
pub fn export_json(results: &ResultSet, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(results)?;
    std::fs::write(path, content)?;
    info!("Wrote {} records to {:?}", record_count(results), path);
    Ok(())
}

fn record_count(results: &ResultSet) -> usize {
    results.values().map(Vec::len).sum()
}
