//! Metric tables and the cross-experiment records file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::Result;
use pser_core::EpochMetrics;

/// Write `rows` as CSV under the column names of `header`.
///
/// Metrics missing from a row, or undefined in it, are left empty.
pub fn write_metrics_csv(path: impl AsRef<Path>, header: &EpochMetrics, rows: &[EpochMetrics]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    let names: Vec<&str> = header.names().collect();
    writer.write_record(&names)?;
    for row in rows {
        writer.write_record(names.iter().map(|name| cell(row.get(name))))?;
    }
    writer.flush()?;
    Ok(())
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// One finished run, as appended to the records file.
#[derive(Debug, Clone)]
pub struct RunRecord<'a> {
    /// When the run started.
    pub timestamp: DateTime<Local>,
    /// Experiment name.
    pub experiment: &'a str,
    /// Validation metrics of the best epoch.
    pub best: Option<&'a EpochMetrics>,
    /// Validation metrics of the last epoch.
    pub last: Option<&'a EpochMetrics>,
    /// Free-text comment.
    pub comment: &'a str,
}

/// Append `record` to the records CSV at `path`, writing a header when the file is new.
///
/// Columns are `timestamp`, `experiment`, `best_epoch`, then `best_<metric>`
/// and `final_<metric>` for every metric of the best row, then `comment`.
/// A file whose header lists other columns is left alone and the row goes to
/// the first of `<stem>_1.csv`, `<stem>_2.csv`, ... that is new or has the
/// same header. Returns the file written to.
pub fn register_record(path: impl AsRef<Path>, record: &RunRecord<'_>) -> Result<PathBuf> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let names: Vec<&str> = record
        .best
        .or(record.last)
        .map(|m| m.names().filter(|n| *n != "epoch").collect())
        .unwrap_or_default();
    let mut header = vec!["timestamp".to_string(), "experiment".to_string(), "best_epoch".to_string()];
    header.extend(names.iter().map(|n| format!("best_{n}")));
    header.extend(names.iter().map(|n| format!("final_{n}")));
    header.push("comment".to_string());

    let mut target = path.to_path_buf();
    let mut suffix = 0;
    let is_new = loop {
        match existing_header(&target)? {
            None => break true,
            Some(found) if found == header => break false,
            Some(_) => {
                suffix += 1;
                target = numbered(path, suffix);
            }
        }
    };
    if suffix > 0 {
        tracing::warn!(
            path = %path.display(),
            target = %target.display(),
            "Records file has different columns, appending elsewhere"
        );
    }

    let file = OpenOptions::new().create(true).append(true).open(&target)?;
    let mut writer = csv::Writer::from_writer(file);
    if is_new {
        writer.write_record(&header)?;
    }

    let mut row = vec![
        record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        record.experiment.to_string(),
        cell(record.best.and_then(|m| m.get("epoch"))),
    ];
    row.extend(names.iter().map(|n| cell(record.best.and_then(|m| m.get(n)))));
    row.extend(names.iter().map(|n| cell(record.last.and_then(|m| m.get(n)))));
    row.push(record.comment.to_string());
    writer.write_record(&row)?;
    writer.flush()?;

    tracing::info!(path = %target.display(), "Exported run record");
    Ok(target)
}

/// Header of an existing, non-empty CSV file.
fn existing_header(path: &Path) -> Result<Option<Vec<String>>> {
    if !path.exists() || std::fs::metadata(path)?.len() == 0 {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)?;
    Ok(Some(reader.headers()?.iter().map(str::to_string).collect()))
}

fn numbered(path: &Path, n: usize) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(name)
}
