//! Shell phase executor.

use std::fs::File;
use std::io;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::Phase;
use crate::dispatch::expand::expand_vars;
use crate::dispatch::process::{
    self, WaitOutcome, capture_string, join_tee, new_capture, spawn_group, tee, wait_with_cancel,
};
use crate::dispatch::{DispatchResult, Environment, phase_deadline, phase_work_dir};
use crate::state::artifacts;

/// Execute a script phase through `bash -c`, teeing stdout and stderr to the
/// terminal, the phase log, and an in-memory capture buffer.
pub fn run_script(
    cancel: &CancelToken,
    phase: &Phase,
    env: &Environment,
) -> Result<DispatchResult> {
    let deadline = phase_deadline(phase);
    let expanded = expand_vars(&phase.run, &env.vars());
    debug!(phase = %phase.name, command = %expanded, "running script phase");

    let log_path = artifacts::log_path(&env.artifacts_dir, env.phase_index);
    let log = File::create(&log_path)
        .with_context(|| format!("create phase log {}", log_path.display()))?;
    let stderr_log = log
        .try_clone()
        .with_context(|| format!("clone phase log {}", log_path.display()))?;

    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(&expanded)
        .current_dir(phase_work_dir(phase, env))
        .env_clear()
        .envs(env.child_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = spawn_group(&mut cmd)?;
    let stdout = child.stdout.take().context("script stdout was not piped")?;
    let stderr = child.stderr.take().context("script stderr was not piped")?;

    let capture = new_capture();
    let out_tee = tee(stdout, io::stdout(), log, Some(capture.clone()));
    let err_tee = tee(stderr, io::stderr(), stderr_log, Some(capture.clone()));

    let verdict = wait_with_cancel(&mut child, cancel, deadline)?;
    join_tee(out_tee)?;
    join_tee(err_tee)?;

    if verdict.outcome == WaitOutcome::TimedOut {
        warn!(phase = %phase.name, timeout_mins = phase.timeout, "script phase timed out");
    }

    Ok(DispatchResult {
        exit_code: process::exit_code(verdict.status),
        output: capture_string(&capture),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseType;
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::{Duration, Instant};

    fn script_phase(run: &str) -> Phase {
        Phase {
            name: "test".to_string(),
            phase_type: Some(PhaseType::Script),
            run: run.to_string(),
            ..Phase::default()
        }
    }

    fn env_in(dir: &Path) -> Environment {
        let artifacts_dir = dir.join("artifacts");
        artifacts::ensure_tree(&artifacts_dir).expect("ensure tree");
        Environment {
            project_root: dir.to_path_buf(),
            work_dir: dir.to_path_buf(),
            artifacts_dir,
            ticket: "TEST-1".to_string(),
            phase_count: 1,
            ..Environment::default()
        }
    }

    #[test]
    fn captures_output_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = env_in(temp.path());
        let phase = script_phase("echo hello from the phase");

        let result = run_script(&CancelToken::new(), &phase, &env).expect("run");
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("hello from the phase"));

        let log = fs::read_to_string(artifacts::log_path(&env.artifacts_dir, 0)).expect("log");
        assert!(log.contains("hello from the phase"));
    }

    #[test]
    fn stderr_is_captured_too() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = env_in(temp.path());
        let phase = script_phase("echo oops >&2; exit 3");

        let result = run_script(&CancelToken::new(), &phase, &env).expect("run");
        assert_eq!(result.exit_code, 3);
        assert!(result.output.contains("oops"));
    }

    #[test]
    fn command_text_is_expanded_against_run_vars() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = env_in(temp.path());
        let phase = script_phase("echo ticket=$TICKET");

        let result = run_script(&CancelToken::new(), &phase, &env).expect("run");
        assert!(result.output.contains("ticket=TEST-1"));
    }

    /// Children must see the run context re-exported with the ORC_ prefix.
    /// `printenv` reads the child environment directly, sidestepping the
    /// pre-dispatch expansion of the command text.
    #[test]
    fn child_sees_orc_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = env_in(temp.path());
        let phase = script_phase("printenv ORC_TICKET ORC_PHASE_COUNT");

        let result = run_script(&CancelToken::new(), &phase, &env).expect("run");
        assert!(result.output.contains("TEST-1"));
        assert!(result.output.contains('1'));
    }

    #[test]
    fn cancellation_kills_a_running_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = env_in(temp.path());
        let phase = script_phase("sleep 30");

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let started = Instant::now();
        let result = run_script(&cancel, &phase, &env).expect("run");
        killer.join().expect("join");

        assert_ne!(result.exit_code, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
