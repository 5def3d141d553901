use crate::config::ExportFormat;
use crate::normalize::START_TIME_FORMAT;
use crate::record::{ProcessRecord, RECORD_FIELDS};
use crate::report::Report;
use chrono::NaiveDateTime;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir { path: String, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error("failed to encode JSON report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes the report in the requested formats and returns the written paths.
pub fn export(
    report: &Report,
    dir: &Path,
    format: ExportFormat,
) -> Result<Vec<PathBuf>, ExportError> {
    if format == ExportFormat::None {
        return Ok(Vec::new());
    }

    fs::create_dir_all(dir).map_err(|source| ExportError::CreateDir {
        path: dir.display().to_string(),
        source,
    })?;

    let stem = file_stem(report);
    let mut written = Vec::new();
    if format.wants_csv() {
        let path = dir.join(format!("{stem}.csv"));
        write_file(&path, render_csv(report).as_bytes())?;
        written.push(path);
    }
    if format.wants_json() {
        let path = dir.join(format!("{stem}.json"));
        let json = serde_json::to_vec_pretty(report)?;
        write_file(&path, &json)?;
        written.push(path);
    }

    for path in &written {
        info!(path = %path.display(), records = report.process_count(), "report written");
    }
    Ok(written)
}

pub fn render_csv(report: &Report) -> String {
    let mut out = RECORD_FIELDS.join(",");
    out.push_str("\r\n");
    for record in report.records() {
        out.push_str(&csv_row(record));
        out.push_str("\r\n");
    }
    out
}

fn csv_row(r: &ProcessRecord) -> String {
    let mut row = String::new();
    let _ = write!(
        row,
        "{},{},{},{},{},{},{},{},{},{},{},{},{}",
        r.pid,
        escape_csv(&r.process_name),
        escape_csv(r.owner.as_str()),
        r.cpu_time_seconds,
        r.cpu_percentage,
        r.working_set_mb,
        r.paged_memory_mb,
        r.total_memory_mb,
        r.memory_percentage,
        r.handle_count,
        r.thread_count,
        escape_csv(&r.start_time.to_string()),
        escape_csv(&r.path.to_string()),
    );
    row
}

/// Quotes a field when it contains a separator, quote or line break.
fn escape_csv(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn file_stem(report: &Report) -> String {
    let stamp = NaiveDateTime::parse_from_str(report.generated_at(), START_TIME_FORMAT)
        .map(|ts| ts.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|_| chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
    format!("ProcessReport_{stamp}")
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let write_err = |source| ExportError::Write {
        path: path.display().to_string(),
        source,
    };
    let file = fs::File::create(path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes).map_err(write_err)?;
    writer.flush().map_err(write_err)?;
    Ok(())
}
