//! Reading session logs back for inspection.
//!
//! Session files are append-only JSONL written by the monitor. A crash can
//! leave a truncated final line; lines that do not parse are skipped, so
//! everything before them stays readable.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::admission::EventKind;
use crate::config::LOG_FILE_EXTENSION;
use crate::error_handling::SessionError;
use crate::monitor::LogEvent;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
    move |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Most recent non-empty session log in `dir`.
///
/// Files are ordered by the start epoch in their name; names that are not a
/// number sort first.
///
/// # Errors
///
/// [`SessionError::NoLogFiles`] if no file has data, [`SessionError::Io`] if
/// the directory cannot be read.
pub fn latest_session_file(dir: &Path) -> Result<PathBuf, SessionError> {
    let entries = fs::read_dir(dir).map_err(io_error(dir))?;
    let mut candidates: Vec<(i64, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_FILE_EXTENSION) {
            continue;
        }
        let non_empty = entry.metadata().map(|m| m.len() > 0).unwrap_or(false);
        if !non_empty {
            continue;
        }
        let epoch = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(i64::MIN);
        candidates.push((epoch, path));
    }
    candidates
        .into_iter()
        .max()
        .map(|(_, path)| path)
        .ok_or_else(|| SessionError::NoLogFiles(dir.to_path_buf()))
}

/// Parses every well-formed event in `path`.
///
/// # Errors
///
/// [`SessionError::Io`] if the file cannot be read.
pub fn load_events(path: &Path) -> Result<Vec<LogEvent>, SessionError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    let mut events = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => log::debug!(
                "Skipping malformed line {} of {}: {}",
                number + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(events)
}

/// Parses CLI line codes (`iroef`...) into event kinds, in the order given.
///
/// Unknown codes and repeats are ignored; an empty selection means all kinds.
pub fn parse_line_codes(codes: &str) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    for code in codes.chars() {
        match EventKind::from_code(code) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None => log::warn!("Ignoring unknown line code '{}'", code),
        }
    }
    if kinds.is_empty() {
        use strum::IntoEnumIterator;
        kinds = EventKind::iter().collect();
    }
    kinds
}

/// One sampled interval of the selected engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Counts in the order of [`Series::kinds`]
    pub values: Vec<u64>,
    /// Ramped rate in requests per minute
    pub current_rate: f64,
    /// Waiting tickets
    pub queue_length: usize,
}

/// Selected counts of one engine over a session.
#[derive(Debug, Clone)]
pub struct Series {
    /// Engine name the rows belong to
    pub name: String,
    /// Session log the rows were read from
    pub file: PathBuf,
    /// Selected event kinds, in column order
    pub kinds: Vec<EventKind>,
    /// One row per sample, oldest first
    pub rows: Vec<SeriesRow>,
}

impl Series {
    /// Sum of each selected kind over the session.
    pub fn totals(&self) -> Vec<u64> {
        let mut totals = vec![0; self.kinds.len()];
        for row in &self.rows {
            for (total, value) in totals.iter_mut().zip(&row.values) {
                *total += value;
            }
        }
        totals
    }

    /// Renders the series as a fixed-width text table, seconds relative to the
    /// first row.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} ({})", self.name, self.file.display());
        let _ = write!(out, "{:>8}", "t+s");
        for kind in &self.kinds {
            let _ = write!(out, " {:>10}", kind.as_str());
        }
        let _ = writeln!(out, " {:>8} {:>6}", "rpm", "queue");

        let start = self.rows.first().map(|r| r.timestamp);
        for row in &self.rows {
            let offset = start
                .map(|s| (row.timestamp - s).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0);
            let _ = write!(out, "{:>8.1}", offset);
            for value in &row.values {
                let _ = write!(out, " {:>10}", value);
            }
            let _ = writeln!(out, " {:>8.1} {:>6}", row.current_rate, row.queue_length);
        }

        let _ = write!(out, "{:>8}", "total");
        for total in self.totals() {
            let _ = write!(out, " {:>10}", total);
        }
        out.push('\n');
        out
    }
}

/// Loads the series of engine `name` from a session in `dir`.
///
/// `file` names a session file inside `dir`; without it the most recent
/// non-empty one is used.
///
/// # Errors
///
/// - [`SessionError::NoLogFiles`] if `dir` holds no session with data
/// - [`SessionError::NoMatchingData`] if the session has no events for `name`
/// - [`SessionError::Io`] on read failures
pub fn load_series(
    dir: &Path,
    file: Option<&str>,
    name: &str,
    kinds: &[EventKind],
) -> Result<Series, SessionError> {
    let path = match file {
        Some(file) => dir.join(file),
        None => latest_session_file(dir)?,
    };
    let rows: Vec<SeriesRow> = load_events(&path)?
        .into_iter()
        .filter(|event| event.engine_name() == name)
        .map(|event| SeriesRow {
            timestamp: event.timestamp,
            values: kinds.iter().map(|k| event.counts.get(*k)).collect(),
            current_rate: event.current_rate,
            queue_length: event.queue_length,
        })
        .collect();

    if rows.is_empty() {
        return Err(SessionError::NoMatchingData {
            name: name.to_string(),
            file: path,
        });
    }
    Ok(Series {
        name: name.to_string(),
        file: path,
        kinds: kinds.to_vec(),
        rows,
    })
}
