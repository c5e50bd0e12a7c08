//! Append-only JSONL session log.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::event::LogEvent;
use crate::config::{LOG_FILE_EXTENSION, MAX_PENDING_EVENTS};
use crate::error_handling::MonitorError;

/// Writer for `<directory>/<start_epoch_seconds>.jsonl`.
///
/// Each event is one JSON object per line. Lines that fail to write stay in a
/// pending buffer and are retried with the next batch; the buffer drops its
/// oldest lines beyond [`MAX_PENDING_EVENTS`]. The file is opened in append
/// mode for every batch and only created once there is something to write.
/// A batch that fails partway is truncated away before the retry.
#[derive(Debug)]
pub(crate) struct SessionLog {
    path: PathBuf,
    pending: VecDeque<String>,
    /// A failed write left a partial line that could not be truncated
    torn: bool,
}

impl SessionLog {
    pub(crate) fn create(directory: &Path, started: DateTime<Utc>) -> Result<Self, MonitorError> {
        fs::create_dir_all(directory).map_err(|source| MonitorError::LogDirectory {
            path: directory.to_path_buf(),
            source,
        })?;
        let path = directory.join(format!("{}.{}", started.timestamp(), LOG_FILE_EXTENSION));
        Ok(SessionLog {
            path,
            pending: VecDeque::new(),
            torn: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queues `events` and writes everything pending. Returns lines written.
    pub(crate) fn append(&mut self, events: &[LogEvent]) -> usize {
        for event in events {
            match serde_json::to_string(event) {
                Ok(line) => self.pending.push_back(line),
                Err(e) => log::warn!("Dropping unserializable log event: {}", e),
            }
        }
        let overflow = self.pending.len().saturating_sub(MAX_PENDING_EVENTS);
        if overflow > 0 {
            self.pending.drain(..overflow);
            log::warn!(
                "Session log backlog full, dropped {} oldest event(s)",
                overflow
            );
        }
        if self.pending.is_empty() {
            return 0;
        }

        match self.write_pending() {
            Ok(()) => {
                let written = self.pending.len();
                self.pending.clear();
                written
            }
            Err(e) => {
                log::warn!(
                    "Failed to write {} event(s) to {}: {} (will retry)",
                    self.pending.len(),
                    self.path.display(),
                    e
                );
                0
            }
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        let mut buffer = String::new();
        if self.torn {
            // Terminate the fragment so the retried lines start clean
            buffer.push('\n');
        }
        for line in &self.pending {
            buffer.push_str(line);
            buffer.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let start = file.metadata()?.len();
        if let Err(e) = file.write_all(buffer.as_bytes()).and_then(|()| file.flush()) {
            if file.set_len(start).is_err() {
                self.torn = true;
            }
            return Err(e);
        }
        self.torn = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{BlockState, EventCounts};
    use tempfile::TempDir;

    fn event(service: &str, requested: u64) -> LogEvent {
        LogEvent {
            timestamp: Utc::now(),
            service: service.to_string(),
            model: None,
            counts: EventCounts {
                requested,
                ..Default::default()
            },
            state: BlockState::Open,
            current_rate: 75.0,
            queue_length: 0,
        }
    }

    #[test]
    fn test_file_named_after_start_epoch() {
        let dir = TempDir::new().unwrap();
        let started = DateTime::from_timestamp(1_718_000_000, 0).unwrap();
        let log = SessionLog::create(dir.path(), started).unwrap();
        assert_eq!(log.path(), dir.path().join("1718000000.jsonl"));
        assert!(!log.path().exists());
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        SessionLog::create(&nested, Utc::now()).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_append_writes_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let mut log = SessionLog::create(dir.path(), Utc::now()).unwrap();
        assert_eq!(log.append(&[event("a", 1), event("b", 2)]), 2);
        assert_eq!(log.append(&[event("a", 3)]), 1);
        assert_eq!(log.append(&[]), 0);

        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: LogEvent = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last.counts.requested, 3);
    }

    #[test]
    fn test_failed_write_is_retried() {
        let dir = TempDir::new().unwrap();
        let mut log = SessionLog::create(dir.path(), Utc::now()).unwrap();
        // A directory at the file path makes the open fail
        fs::create_dir(log.path()).unwrap();
        assert_eq!(log.append(&[event("a", 1)]), 0);
        assert_eq!(log.pending_len(), 1);

        fs::remove_dir(log.path()).unwrap();
        assert_eq!(log.append(&[event("a", 2)]), 2);
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn test_retry_after_torn_write_starts_on_new_line() {
        let dir = TempDir::new().unwrap();
        let mut log = SessionLog::create(dir.path(), Utc::now()).unwrap();
        assert_eq!(log.append(&[event("a", 1)]), 1);

        // An interrupted write that could not be truncated
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(br#"{"timestamp":"2024-06"#).unwrap();
        log.torn = true;

        assert_eq!(log.append(&[event("a", 2)]), 1);
        let events = crate::session::load_events(log.path()).unwrap();
        let requested: Vec<u64> = events.iter().map(|e| e.counts.requested).collect();
        assert_eq!(requested, vec![1, 2]);
        assert!(!log.torn);
    }
}
