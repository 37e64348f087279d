//! Interactive gate executor: human approval between phases.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::cancel::CancelToken;
use crate::config::Phase;
use crate::dispatch::{DispatchResult, Environment};
use crate::state::artifacts;

const POLL: Duration = Duration::from_millis(100);

/// Prompt the operator for approval. `y`/`yes` approves; anything else is a
/// revision request returned as a failure with the typed text as output.
/// Auto-mode records an auto-approval without reading input.
pub fn run_gate(cancel: &CancelToken, phase: &Phase, env: &Environment) -> Result<DispatchResult> {
    run_gate_with_input(cancel, phase, env, BufReader::new(io::stdin()))
}

/// Gate body with an injectable input source, raced against cancellation.
pub fn run_gate_with_input<R>(
    cancel: &CancelToken,
    phase: &Phase,
    env: &Environment,
    input: R,
) -> Result<DispatchResult>
where
    R: BufRead + Send + 'static,
{
    let log_path = artifacts::log_path(&env.artifacts_dir, env.phase_index);
    let mut log = File::create(&log_path)
        .with_context(|| format!("create gate log {}", log_path.display()))?;

    if env.auto_mode {
        let msg = format!("Gate {:?} auto-approved (--auto mode)\n", phase.name);
        print!("{msg}");
        log.write_all(msg.as_bytes()).context("write gate log")?;
        return Ok(DispatchResult {
            exit_code: 0,
            output: msg,
        });
    }

    if !phase.description.is_empty() {
        println!("\n  {}\n", phase.description);
    }
    print!("  [y to continue / feedback to revise]: ");
    io::stdout().flush().context("flush gate prompt")?;

    // Race the blocking line read against the cancellation token.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut input = input;
        let mut line = String::new();
        let result = input.read_line(&mut line).map(|_| line);
        let _ = tx.send(result);
    });

    let line = loop {
        if cancel.is_cancelled() {
            let msg = "Gate cancelled\n";
            log.write_all(msg.as_bytes()).context("write gate log")?;
            return Ok(DispatchResult {
                exit_code: 1,
                output: msg.to_string(),
            });
        }
        match rx.recv_timeout(POLL) {
            Ok(Ok(line)) => break line,
            Ok(Err(err)) => return Err(err).context("read gate input"),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("gate input closed"),
        }
    };

    let answer = line.trim();
    if matches!(answer.to_lowercase().as_str(), "y" | "yes") {
        let msg = format!("Gate {:?} approved\n", phase.name);
        print!("{msg}");
        log.write_all(msg.as_bytes()).context("write gate log")?;
        return Ok(DispatchResult {
            exit_code: 0,
            output: msg,
        });
    }

    let msg = format!("Gate {:?} — revision requested\n", phase.name);
    print!("{msg}");
    log.write_all(msg.as_bytes()).context("write gate log")?;
    log.write_all(format!("Feedback: {answer}\n").as_bytes())
        .context("write gate log")?;
    Ok(DispatchResult {
        exit_code: 1,
        output: answer.to_string(),
    })
}
