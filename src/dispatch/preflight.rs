//! Pre-run check that every binary the workflow needs is on PATH.

use std::collections::BTreeSet;

use anyhow::{Result, bail};

use crate::config::{Phase, PhaseType};

/// Verify that the binaries required by the workflow's phases are available
/// before any phase runs.
pub fn preflight(phases: &[Phase]) -> Result<()> {
    let mut needed = BTreeSet::new();
    for phase in phases {
        match phase.phase_type {
            Some(PhaseType::Script) => {
                needed.insert("bash");
            }
            Some(PhaseType::Agent) => {
                needed.insert("claude");
            }
            _ => {}
        }
        if !phase.condition.is_empty() {
            needed.insert("bash");
        }
    }

    let missing: Vec<&str> = needed
        .into_iter()
        .filter(|bin| !found_on_path(bin))
        .collect();
    if !missing.is_empty() {
        bail!(
            "required binaries not found in PATH: {}",
            missing.join(", ")
        );
    }
    Ok(())
}

fn found_on_path(bin: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(run: &str) -> Phase {
        Phase {
            name: "s".to_string(),
            phase_type: Some(PhaseType::Script),
            run: run.to_string(),
            ..Phase::default()
        }
    }

    #[test]
    fn script_phases_need_only_bash() {
        preflight(&[script("echo hi")]).expect("bash is available");
    }

    #[test]
    fn gate_phases_need_nothing() {
        let gate = Phase {
            name: "g".to_string(),
            phase_type: Some(PhaseType::Gate),
            ..Phase::default()
        };
        preflight(&[gate]).expect("no binaries needed");
    }

    #[test]
    fn missing_binary_is_reported() {
        assert!(!found_on_path("definitely-not-a-real-binary-5309"));
    }
}
