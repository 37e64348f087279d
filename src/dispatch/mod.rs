//! Phase dispatch: the execution environment, the per-kind executors, and the
//! uniform result contract between them and the runner.

pub mod agent;
pub mod expand;
pub mod gate;
pub mod preflight;
pub mod process;
pub mod script;
pub mod stdin_reader;
pub mod stream;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::cancel::CancelToken;
use crate::config::{Phase, PhaseType};
use crate::dispatch::expand::expand_vars;

/// Environment variables starting with this prefix are stripped from child
/// processes so an agent CLI that detects its own presence does not refuse to
/// run nested under the orchestrator.
pub const SELF_NESTING_MARKER: &str = "CLAUDECODE";

/// Prefix under which run context is re-exported to children.
pub const EXPORT_PREFIX: &str = "ORC_";

/// Parent process environment minus the self-nesting marker, snapshotted on
/// first use and shared by every child process of the run.
static FILTERED_ENV: LazyLock<Vec<(String, String)>> = LazyLock::new(|| {
    std::env::vars()
        .filter(|(key, _)| !key.starts_with(SELF_NESTING_MARKER))
        .collect()
});

/// Immutable per-run execution context handed to every dispatcher.
///
/// Cloning produces a deep copy (the custom-variable map does not alias),
/// which is what the parallel coordinator relies on: each worker mutates its
/// own `phase_index` independently.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub project_root: PathBuf,
    pub work_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub ticket: String,
    pub phase_index: usize,
    pub phase_count: usize,
    /// Skip human gates and agent steering.
    pub auto_mode: bool,
    pub custom_vars: BTreeMap<String, String>,
}

impl Environment {
    /// Variable substitution map for prompts and commands. Custom vars are
    /// inserted first; built-ins always win.
    pub fn vars(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = self
            .custom_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("TICKET".to_string(), self.ticket.clone());
        map.insert(
            "ARTIFACTS_DIR".to_string(),
            self.artifacts_dir.to_string_lossy().into_owned(),
        );
        map.insert(
            "WORK_DIR".to_string(),
            self.work_dir.to_string_lossy().into_owned(),
        );
        map.insert(
            "PROJECT_ROOT".to_string(),
            self.project_root.to_string_lossy().into_owned(),
        );
        map
    }

    /// Full environment for child processes: the filtered parent environment
    /// plus every built-in and custom variable re-exported with the `ORC_`
    /// prefix.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let filtered = &*FILTERED_ENV;
        let mut result = Vec::with_capacity(filtered.len() + 6 + self.custom_vars.len());
        result.extend(filtered.iter().cloned());
        for (key, value) in &self.custom_vars {
            result.push((format!("{EXPORT_PREFIX}{key}"), value.clone()));
        }
        result.push((format!("{EXPORT_PREFIX}TICKET"), self.ticket.clone()));
        result.push((
            format!("{EXPORT_PREFIX}ARTIFACTS_DIR"),
            self.artifacts_dir.to_string_lossy().into_owned(),
        ));
        result.push((
            format!("{EXPORT_PREFIX}WORK_DIR"),
            self.work_dir.to_string_lossy().into_owned(),
        ));
        result.push((
            format!("{EXPORT_PREFIX}PROJECT_ROOT"),
            self.project_root.to_string_lossy().into_owned(),
        ));
        result.push((
            format!("{EXPORT_PREFIX}PHASE_INDEX"),
            self.phase_index.to_string(),
        ));
        result.push((
            format!("{EXPORT_PREFIX}PHASE_COUNT"),
            self.phase_count.to_string(),
        ));
        result
    }
}

/// Working directory for a phase: the `cwd` template expanded with the full
/// variable map, falling back to the environment's work dir when absent or
/// when the expansion comes out empty.
pub fn phase_work_dir(phase: &Phase, env: &Environment) -> PathBuf {
    if phase.cwd.is_empty() {
        return env.work_dir.clone();
    }
    let expanded = expand_vars(&phase.cwd, &env.vars());
    if expanded.is_empty() {
        env.work_dir.clone()
    } else {
        PathBuf::from(expanded)
    }
}

/// Deadline derived from the phase timeout (minutes). Zero means no deadline.
pub fn phase_deadline(phase: &Phase) -> Option<Instant> {
    (phase.timeout > 0).then(|| Instant::now() + Duration::from_secs(phase.timeout * 60))
}

/// Outcome of a phase dispatch. A non-zero exit code signals phase failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchResult {
    pub exit_code: i32,
    pub output: String,
}

/// Executor seam between the runner and the real phase executors. Tests
/// substitute scripted implementations.
pub trait Dispatcher: Sync {
    fn dispatch(
        &self,
        cancel: &CancelToken,
        phase: &Phase,
        env: &Environment,
    ) -> Result<DispatchResult>;

    /// One extra agent turn with a caller-supplied prompt, appending to the
    /// phase log. Used by the output-validation retry. Dispatchers without
    /// re-prompt support may keep this default no-op.
    fn reprompt(
        &self,
        _cancel: &CancelToken,
        _phase: &Phase,
        _env: &Environment,
        _prompt: &str,
    ) -> Result<DispatchResult> {
        Ok(DispatchResult::default())
    }
}

/// Routes phases to the real executors.
pub struct DefaultDispatcher {
    /// Workflow-wide tool permissions from the configuration.
    pub default_allow_tools: Vec<String>,
}

impl Dispatcher for DefaultDispatcher {
    fn dispatch(
        &self,
        cancel: &CancelToken,
        phase: &Phase,
        env: &Environment,
    ) -> Result<DispatchResult> {
        let Some(kind) = phase.phase_type else {
            bail!("phase {:?} has no type (config not validated)", phase.name);
        };
        match kind {
            PhaseType::Script => script::run_script(cancel, phase, env),
            PhaseType::Agent => {
                if env.auto_mode {
                    agent::run_agent(cancel, phase, env, &self.default_allow_tools)
                } else {
                    agent::run_agent_attended(cancel, phase, env, &self.default_allow_tools)
                }
            }
            PhaseType::Gate => gate::run_gate(cancel, phase, env),
        }
    }

    fn reprompt(
        &self,
        cancel: &CancelToken,
        phase: &Phase,
        env: &Environment,
        prompt: &str,
    ) -> Result<DispatchResult> {
        agent::run_agent_with_prompt(cancel, phase, env, &self.default_allow_tools, prompt)
    }
}
