//! Append-only timing ledger (`timing.json`) for per-phase wall-clock records.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::atomic::write_json_atomic;

/// One phase execution window. A phase that runs more than once (loop-back or
/// parallel re-entry) gets one entry per execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingEntry {
    pub phase: String,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// In-memory timing ledger. The entry list is mutex-guarded because the
/// parallel coordinator's workers and the main loop touch it concurrently.
#[derive(Debug, Default)]
pub struct Timing {
    entries: Mutex<Vec<TimingEntry>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TimingFile {
    entries: Vec<TimingEntry>,
}

fn timing_path(artifacts_dir: &Path) -> PathBuf {
    artifacts_dir.join("timing.json")
}

impl Timing {
    /// Load timing data from the artifacts directory, empty when absent.
    pub fn load(artifacts_dir: &Path) -> Result<Timing> {
        let path = timing_path(artifacts_dir);
        if !path.exists() {
            return Ok(Timing::default());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read timing {}", path.display()))?;
        let file: TimingFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse timing {}", path.display()))?;
        Ok(Timing {
            entries: Mutex::new(file.entries),
        })
    }

    /// Append a new open entry for the given phase.
    pub fn add_start(&self, phase: &str) {
        let mut entries = self.entries.lock().expect("timing lock poisoned");
        entries.push(TimingEntry {
            phase: phase.to_string(),
            start: Utc::now(),
            end: None,
            duration: None,
        });
    }

    /// Close the most recent open entry for the given phase, if any.
    pub fn add_end(&self, phase: &str) {
        let mut entries = self.entries.lock().expect("timing lock poisoned");
        if let Some(entry) = entries
            .iter_mut()
            .rev()
            .find(|entry| entry.phase == phase && entry.end.is_none())
        {
            let end = Utc::now();
            entry.duration = Some(format_duration(end - entry.start));
            entry.end = Some(end);
        }
    }

    /// Atomically write the ledger to disk.
    pub fn flush(&self, artifacts_dir: &Path) -> Result<()> {
        let entries = self.entries.lock().expect("timing lock poisoned");
        write_json_atomic(
            &timing_path(artifacts_dir),
            &TimingFile {
                entries: entries.clone(),
            },
        )
    }

    /// Snapshot of the current entries (for status rendering and tests).
    pub fn entries(&self) -> Vec<TimingEntry> {
        self.entries.lock().expect("timing lock poisoned").clone()
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds().max(0);
    format!("{}m {:02}s", total_secs / 60, total_secs % 60)
}
