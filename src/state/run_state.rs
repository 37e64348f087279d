//! Run state storage (`state.json`): current phase index, ticket, and status.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::atomic::write_json_atomic;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

/// Persisted position of a run in its workflow.
///
/// Written atomically after every phase transition; `phase_index` on disk
/// always reflects either the pre-dispatch or post-completion value of the
/// current phase, never an intermediate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Index of the phase to execute next (0-based).
    pub phase_index: usize,
    /// Ticket identifier the run was started with.
    pub ticket: String,
    pub status: RunStatus,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase_index: 0,
            ticket: String::new(),
            status: RunStatus::Running,
        }
    }
}

impl RunState {
    /// Move past the current phase.
    pub fn advance(&mut self) {
        self.phase_index += 1;
    }

    /// Reposition for retry/from/on-fail jumps.
    pub fn set_phase(&mut self, index: usize) {
        self.phase_index = index;
    }
}

pub fn state_path(artifacts_dir: &Path) -> PathBuf {
    artifacts_dir.join("state.json")
}

/// Load run state from the artifacts directory. Returns a fresh state when no
/// file exists yet.
pub fn load_state(artifacts_dir: &Path) -> Result<RunState> {
    let path = state_path(artifacts_dir);
    if !path.exists() {
        return Ok(RunState::default());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(phase_index = state.phase_index, ticket = %state.ticket, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk.
pub fn save_state(artifacts_dir: &Path, state: &RunState) -> Result<()> {
    debug!(phase_index = state.phase_index, status = ?state.status, "writing run state");
    write_json_atomic(&state_path(artifacts_dir), state)
}
