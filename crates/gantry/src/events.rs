//! Append-only JSONL event log.
//!
//! One line per [`RunEvent`], appended at the end of every job so the log
//! survives a failed run. Payloads carry names and digests only; secret
//! material and credential metadata never appear here.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::types::{EventKind, RunEvent};

/// Default events file name.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record an event stamped with the current time.
    pub fn record(&mut self, job: &str, kind: EventKind) {
        self.events.push(RunEvent {
            timestamp: Utc::now(),
            kind,
            job: job.to_string(),
        });
    }

    /// Append all recorded events to `path` and clear the buffer.
    pub fn flush_to_file(&mut self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        self.events.clear();
        Ok(())
    }

    /// Read all events back from a JSONL file.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("failed to read events file {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn events_for_job(&self, job: &str) -> Vec<&RunEvent> {
        self.events.iter().filter(|e| e.job == job).collect()
    }
}
