//! The workflow state machine: iterates phases, evaluates conditions, launches
//! parallel pairs, applies on-failure backward jumps, and persists state after
//! every transition.

use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::{Config, Phase, PhaseType};
use crate::dispatch::process::{WaitOutcome, spawn_group, wait_with_cancel};
use crate::dispatch::{Dispatcher, Environment, expand::expand_vars};
use crate::state::artifacts;
use crate::state::run_state::{RunState, RunStatus, save_state};
use crate::state::timing::Timing;
use crate::ux;

/// Marker error for a run stopped by outer cancellation. The run is resumable
/// at the interrupted phase.
#[derive(Debug, Error)]
#[error("run interrupted")]
pub struct Interrupted;

/// Drives the workflow from the current persisted state to completion.
pub struct Runner<D> {
    pub config: Config,
    pub state: RunState,
    pub env: Environment,
    pub dispatcher: D,
    timing: Timing,
}

impl<D: Dispatcher> Runner<D> {
    pub fn new(config: Config, state: RunState, env: Environment, dispatcher: D) -> Self {
        Self {
            config,
            state,
            env,
            dispatcher,
            timing: Timing::default(),
        }
    }

    /// Set the failure status, persist best-effort, print a resume hint, and
    /// hand back the primary error.
    fn fail_and_hint(&mut self, status: RunStatus, err: anyhow::Error) -> anyhow::Error {
        self.state.status = status;
        if let Err(save_err) = save_state(&self.env.artifacts_dir, &self.state) {
            warn!(error = %format!("{save_err:#}"), "failed to save state");
        }
        if let Err(flush_err) = self.timing.flush(&self.env.artifacts_dir) {
            warn!(error = %format!("{flush_err:#}"), "failed to flush timing");
        }
        ux::resume_hint(&self.state.ticket);
        err
    }

    /// Execute the workflow from the current state until completion, terminal
    /// failure, or cancellation.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        artifacts::ensure_tree(&self.env.artifacts_dir)?;

        let mut loop_counts =
            artifacts::load_loop_counts(&self.env.artifacts_dir).context("loading loop counts")?;
        self.timing = Timing::load(&self.env.artifacts_dir).context("loading timing")?;

        let total = self.config.phases.len();

        while self.state.phase_index < total {
            let i = self.state.phase_index;
            let phase = self.config.phases[i].clone();

            if cancel.is_cancelled() {
                return Err(self.fail_and_hint(RunStatus::Interrupted, Interrupted.into()));
            }

            // A condition is a predicate, not an error: non-zero exit skips
            // the phase silently.
            if !phase.condition.is_empty() && !eval_condition(cancel, &phase.condition, &self.env)
            {
                ux::phase_skip(i, &phase.name);
                self.state.advance();
                save_state(&self.env.artifacts_dir, &self.state)
                    .context("saving state after skip")?;
                continue;
            }

            if !phase.parallel_with.is_empty() {
                let Some(partner) = self.config.phase_index(&phase.parallel_with) else {
                    return Err(self.fail_and_hint(
                        RunStatus::Failed,
                        anyhow!(
                            "phase {:?}: parallel-with {:?} not found",
                            phase.name,
                            phase.parallel_with
                        ),
                    ));
                };
                if partner > i {
                    self.run_parallel(cancel, i, partner)?;
                    continue;
                }
                // Partner is earlier: the pair already ran as a unit, so this
                // phase dispatches on its own.
            }

            ux::phase_header(i, total, &phase);
            self.timing.add_start(&phase.name);
            self.env.phase_index = i;
            let started = Instant::now();

            let outcome = self.dispatcher.dispatch(cancel, &phase, &self.env);

            if cancel.is_cancelled() {
                return Err(self.fail_and_hint(RunStatus::Interrupted, Interrupted.into()));
            }

            match outcome {
                Ok(result) if result.exit_code == 0 => {}
                outcome => {
                    let (err_msg, output) = match outcome {
                        Err(err) => (format!("{err:#}"), String::new()),
                        Ok(result) => ("non-zero exit".to_string(), result.output),
                    };
                    ux::phase_fail(i, &phase.name, &err_msg);
                    print_agent_hint(&phase);

                    let Some(on_fail) = &phase.on_fail else {
                        return Err(self.fail_and_hint(
                            RunStatus::Failed,
                            anyhow!("phase {:?} failed: {err_msg}", phase.name),
                        ));
                    };

                    let count = loop_counts.get(&phase.name).copied().unwrap_or(0) + 1;
                    if count > on_fail.max {
                        println!(
                            "\n  Phase {:?} failed after {} retry loops. Manual intervention needed.",
                            phase.name, on_fail.max
                        );
                        return Err(self.fail_and_hint(
                            RunStatus::Failed,
                            anyhow!(
                                "phase {:?} exceeded max retries ({})",
                                phase.name,
                                on_fail.max
                            ),
                        ));
                    }

                    loop_counts.insert(phase.name.clone(), count);
                    if let Err(err) =
                        artifacts::save_loop_counts(&self.env.artifacts_dir, &loop_counts)
                    {
                        return Err(self.fail_and_hint(
                            RunStatus::Failed,
                            err.context("saving loop counts"),
                        ));
                    }

                    let feedback = if output.is_empty() { err_msg } else { output };
                    artifacts::write_feedback(&self.env.artifacts_dir, &phase.name, &feedback)?;

                    let Some(goto_idx) = self.config.phase_index(&on_fail.target) else {
                        return Err(self.fail_and_hint(
                            RunStatus::Failed,
                            anyhow!(
                                "phase {:?}: on-fail.goto {:?} not found",
                                phase.name,
                                on_fail.target
                            ),
                        ));
                    };
                    ux::loop_back(&phase.name, &on_fail.target, count, on_fail.max);

                    self.state.set_phase(goto_idx);
                    save_state(&self.env.artifacts_dir, &self.state)
                        .context("saving state after loop-back")?;
                    continue;
                }
            };

            if let Err(err_msg) = self.validate_outputs(cancel, &phase) {
                ux::phase_fail(i, &phase.name, &err_msg);
                print_agent_hint(&phase);
                return Err(self.fail_and_hint(
                    RunStatus::Failed,
                    anyhow!("phase {:?}: {err_msg}", phase.name),
                ));
            }

            self.timing.add_end(&phase.name);
            if let Err(err) = self.timing.flush(&self.env.artifacts_dir) {
                warn!(error = %format!("{err:#}"), "failed to flush timing");
            }
            self.state.advance();
            self.state.status = RunStatus::Running;
            save_state(&self.env.artifacts_dir, &self.state)
                .context("saving state after phase advance")?;
            ux::phase_complete(i, started.elapsed());
        }

        self.state.status = RunStatus::Completed;
        save_state(&self.env.artifacts_dir, &self.state).context("saving final state")?;
        self.timing
            .flush(&self.env.artifacts_dir)
            .context("flushing timing")?;
        ux::success(total);
        Ok(())
    }

    /// Enumerate missing declared outputs. Agent phases get exactly one
    /// directive re-prompt per missing file before the re-scan; anything still
    /// missing fails the phase.
    fn validate_outputs(&mut self, cancel: &CancelToken, phase: &Phase) -> Result<(), String> {
        if phase.outputs.is_empty() {
            return Ok(());
        }
        let mut missing = artifacts::check_outputs(&self.env.artifacts_dir, &phase.outputs);
        if !missing.is_empty() && phase.phase_type == Some(PhaseType::Agent) {
            for name in &missing {
                let path = self.env.artifacts_dir.join(name);
                let prompt = format!(
                    "You did not produce the expected artifact at \"{}\". Please produce it now.",
                    path.display()
                );
                if let Err(err) = self.dispatcher.reprompt(cancel, phase, &self.env, &prompt) {
                    warn!(
                        phase = %phase.name,
                        error = %format!("{err:#}"),
                        "re-prompt for missing output failed"
                    );
                }
            }
            missing = artifacts::check_outputs(&self.env.artifacts_dir, &phase.outputs);
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing outputs: {missing:?}"))
        }
    }

    /// Run the phases at `idx1 < idx2` concurrently and join at a barrier.
    /// The first failure cancels the sibling's subprocess through a derived
    /// token; on success the state advances past both in one step.
    fn run_parallel(&mut self, cancel: &CancelToken, idx1: usize, idx2: usize) -> Result<()> {
        let total = self.config.phases.len();
        let phase1 = self.config.phases[idx1].clone();
        let phase2 = self.config.phases[idx2].clone();

        ux::phase_header(idx1, total, &phase1);
        ux::phase_header(idx2, total, &phase2);
        self.timing.add_start(&phase1.name);
        self.timing.add_start(&phase2.name);

        let child = cancel.child();
        let started = Instant::now();

        let dispatcher = &self.dispatcher;
        let timing = &self.timing;
        let env_proto = self.env.clone();

        let first_err: Option<anyhow::Error> = thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for (idx, phase) in [(idx1, &phase1), (idx2, &phase2)] {
                let tx = tx.clone();
                let worker_cancel = child.clone();
                let mut env = env_proto.clone();
                env.phase_index = idx;
                scope.spawn(move || {
                    let outcome = dispatcher.dispatch(&worker_cancel, phase, &env);
                    let _ = tx.send((idx, outcome));
                });
            }
            drop(tx);

            let mut first_err = None;
            for (idx, outcome) in rx {
                let phase = if idx == idx1 { &phase1 } else { &phase2 };
                let failure = match &outcome {
                    Err(err) => Some(format!("{err:#}")),
                    Ok(result) if result.exit_code != 0 => Some("non-zero exit".to_string()),
                    Ok(_) => None,
                };
                match failure {
                    Some(err_msg) => {
                        // Stop the sibling's subprocess as well.
                        child.cancel();
                        ux::phase_fail(idx, &phase.name, &err_msg);
                        if first_err.is_none() {
                            first_err =
                                Some(anyhow!("phase {:?} failed: {err_msg}", phase.name));
                        }
                    }
                    None => {
                        timing.add_end(&phase.name);
                        ux::phase_complete(idx, started.elapsed());
                    }
                }
            }
            first_err
        });

        if let Some(err) = first_err {
            if cancel.is_cancelled() {
                return Err(self.fail_and_hint(RunStatus::Interrupted, Interrupted.into()));
            }
            return Err(self.fail_and_hint(RunStatus::Failed, err));
        }

        for (idx, phase) in [(idx1, &phase1), (idx2, &phase2)] {
            let missing = artifacts::check_outputs(&self.env.artifacts_dir, &phase.outputs);
            if !missing.is_empty() {
                let err_msg = format!("missing outputs: {missing:?}");
                ux::phase_fail(idx, &phase.name, &err_msg);
                return Err(self.fail_and_hint(
                    RunStatus::Failed,
                    anyhow!("phase {:?}: {err_msg}", phase.name),
                ));
            }
        }

        self.state.set_phase(idx1.max(idx2) + 1);
        save_state(&self.env.artifacts_dir, &self.state)
            .context("saving state after parallel advance")?;
        self.timing
            .flush(&self.env.artifacts_dir)
            .context("flushing timing after parallel")?;
        Ok(())
    }

    /// Print the phase plan without executing anything.
    pub fn dry_run_print(&self) {
        let total = self.config.phases.len();
        println!("\n{}Dry run — {total} phases:{}\n", ux::BOLD, ux::RESET);
        for (i, phase) in self.config.phases.iter().enumerate() {
            let kind = match phase.phase_type {
                Some(PhaseType::Script) => "script",
                Some(PhaseType::Agent) => "agent",
                Some(PhaseType::Gate) => "gate",
                None => "unknown",
            };
            print!(
                "  {}{}.{} {}{}{} ({kind})",
                ux::CYAN,
                i + 1,
                ux::RESET,
                ux::BOLD,
                phase.name,
                ux::RESET
            );
            if !phase.description.is_empty() {
                print!(" — {}", phase.description);
            }
            println!();

            match phase.phase_type {
                Some(PhaseType::Script) => {
                    println!("     run: {}", expand_vars(&phase.run, &self.env.vars()));
                }
                Some(PhaseType::Agent) => {
                    println!("     prompt: {}", phase.prompt);
                    println!("     model: {}, timeout: {}m", phase.model, phase.timeout);
                }
                _ => {}
            }

            if !phase.outputs.is_empty() {
                println!("     outputs: {:?}", phase.outputs);
            }
            if let Some(on_fail) = &phase.on_fail {
                println!("     on-fail: goto {} (max {})", on_fail.target, on_fail.max);
            }
            if !phase.condition.is_empty() {
                println!("     condition: {}", phase.condition);
            }
            if !phase.parallel_with.is_empty() {
                println!("     parallel-with: {}", phase.parallel_with);
            }
        }
        println!();
    }
}

fn print_agent_hint(phase: &Phase) {
    if phase.phase_type == Some(PhaseType::Agent) {
        eprintln!(
            "  hint: if the agent couldn't perform actions, check your .claude/settings.local.json permissions"
        );
    }
}

/// Run a gating shell command; true means the phase should execute.
fn eval_condition(cancel: &CancelToken, condition: &str, env: &Environment) -> bool {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(condition)
        .current_dir(&env.work_dir)
        .env_clear()
        .envs(env.child_env())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let Ok(mut child) = spawn_group(&mut cmd) else {
        return false;
    };
    match wait_with_cancel(&mut child, cancel, None) {
        Ok(verdict) => verdict.outcome == WaitOutcome::Completed && verdict.status.success(),
        Err(_) => false,
    }
}

/// Reset loop counters, as required when the operator restarts from an
/// explicit phase.
pub fn reset_loop_counts(artifacts_dir: &std::path::Path) -> Result<()> {
    artifacts::save_loop_counts(artifacts_dir, &BTreeMap::new()).context("resetting loop counts")
}
