//! Canonical layout of the per-run artifacts tree.
//!
//! ```text
//! <artifacts>/
//!   state.json            run position and status
//!   timing.json           timing ledger
//!   loop-counts.json      on-fail jump counters
//!   prompts/phase-N.md    rendered agent prompts (1-indexed)
//!   logs/phase-N.log      captured phase output
//!   feedback/from-X.md    failure payloads for retargeted retries
//!   <declared outputs>    files phases promise to produce
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::state::atomic::{write_atomic, write_json_atomic};

/// Create the artifacts directory structure.
pub fn ensure_tree(artifacts_dir: &Path) -> Result<()> {
    for dir in [
        artifacts_dir.to_path_buf(),
        artifacts_dir.join("prompts"),
        artifacts_dir.join("logs"),
        artifacts_dir.join("feedback"),
    ] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("create artifacts dir {}", dir.display()))?;
    }
    Ok(())
}

fn loop_counts_path(artifacts_dir: &Path) -> PathBuf {
    artifacts_dir.join("loop-counts.json")
}

/// Load the per-phase on-fail jump counters, empty when absent.
pub fn load_loop_counts(artifacts_dir: &Path) -> Result<BTreeMap<String, u32>> {
    let path = loop_counts_path(artifacts_dir);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write the loop counters.
pub fn save_loop_counts(artifacts_dir: &Path, counts: &BTreeMap<String, u32>) -> Result<()> {
    write_json_atomic(&loop_counts_path(artifacts_dir), counts)
}

/// Write a failing phase's output where the loop-back target's prompt can
/// find it (`feedback/from-<phase>.md`).
pub fn write_feedback(artifacts_dir: &Path, from_phase: &str, content: &str) -> Result<()> {
    let path = artifacts_dir
        .join("feedback")
        .join(format!("from-{from_phase}.md"));
    write_atomic(&path, content.as_bytes())
        .with_context(|| format!("write feedback from phase {from_phase:?}"))
}

/// Declared output files missing from the artifacts root.
pub fn check_outputs(artifacts_dir: &Path, outputs: &[String]) -> Vec<String> {
    outputs
        .iter()
        .filter(|name| !artifacts_dir.join(name).exists())
        .cloned()
        .collect()
}

/// Path of the rendered prompt for the phase at `index` (0-based in, 1-indexed
/// on disk for human inspection).
pub fn prompt_path(artifacts_dir: &Path, index: usize) -> PathBuf {
    artifacts_dir
        .join("prompts")
        .join(format!("phase-{}.md", index + 1))
}

/// Path of the captured log for the phase at `index`.
pub fn log_path(artifacts_dir: &Path, index: usize) -> PathBuf {
    artifacts_dir
        .join("logs")
        .join(format!("phase-{}.log", index + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_creates_all_subdirectories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("artifacts");
        ensure_tree(&dir).expect("ensure");

        for sub in ["prompts", "logs", "feedback"] {
            assert!(dir.join(sub).is_dir(), "missing {sub}");
        }
    }

    #[test]
    fn loop_counts_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut counts = BTreeMap::new();
        counts.insert("review".to_string(), 2u32);

        save_loop_counts(temp.path(), &counts).expect("save");
        let loaded = load_loop_counts(temp.path()).expect("load");
        assert_eq!(loaded, counts);
    }

    #[test]
    fn missing_loop_counts_are_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_loop_counts(temp.path()).expect("load").is_empty());
    }

    #[test]
    fn feedback_lands_under_from_prefixed_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        ensure_tree(temp.path()).expect("ensure");

        write_feedback(temp.path(), "verify", "tests failed").expect("write");
        let contents =
            fs::read_to_string(temp.path().join("feedback/from-verify.md")).expect("read");
        assert_eq!(contents, "tests failed");
    }

    #[test]
    fn check_outputs_reports_only_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("present.md"), "x").expect("write");

        let missing = check_outputs(
            temp.path(),
            &["present.md".to_string(), "absent.md".to_string()],
        );
        assert_eq!(missing, vec!["absent.md".to_string()]);
    }

    #[test]
    fn prompt_and_log_paths_are_one_indexed() {
        let dir = Path::new("/tmp/a");
        assert!(prompt_path(dir, 0).ends_with("prompts/phase-1.md"));
        assert!(log_path(dir, 2).ends_with("logs/phase-3.log"));
    }
}
