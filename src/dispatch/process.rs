//! Process-group supervision for phase subprocesses.
//!
//! Every phase child starts in its own process group so that cancellation can
//! reach grandchildren (workers spawned by the agent CLI). Termination is
//! always group-wide: SIGTERM, a bounded grace window, then SIGKILL. Output
//! pipes are drained on background threads while the supervisor waits, so a
//! child that fills its pipe buffer cannot deadlock the engine.

use std::fs::File;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::debug;
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// Poll granularity while waiting on a child with cancellation checks.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Grace window between SIGTERM and SIGKILL on group termination.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// How a supervised wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child exited on its own.
    Completed,
    /// The cancellation token fired; the group was terminated.
    Cancelled,
    /// The deadline passed; the group was terminated.
    TimedOut,
}

/// Result of [`wait_with_cancel`]: why the wait ended plus the child's final
/// exit status (post-kill for cancelled/timed-out children).
#[derive(Debug)]
pub struct WaitVerdict {
    pub outcome: WaitOutcome,
    pub status: ExitStatus,
}

/// Spawn `cmd` as the leader of a fresh process group.
pub fn spawn_group(cmd: &mut Command) -> Result<Child> {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
    cmd.spawn().context("spawn phase subprocess")
}

/// Block until the child exits, the token cancels, or the deadline passes.
/// Cancellation and timeout both terminate the child's entire process group
/// before returning.
pub fn wait_with_cancel(
    child: &mut Child,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> Result<WaitVerdict> {
    loop {
        if cancel.is_cancelled() {
            let status = terminate_group(child)?;
            return Ok(WaitVerdict {
                outcome: WaitOutcome::Cancelled,
                status,
            });
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let status = terminate_group(child)?;
            return Ok(WaitVerdict {
                outcome: WaitOutcome::TimedOut,
                status,
            });
        }
        if let Some(status) = child
            .wait_timeout(WAIT_POLL)
            .context("wait for phase subprocess")?
        {
            return Ok(WaitVerdict {
                outcome: WaitOutcome::Completed,
                status,
            });
        }
    }
}

/// SIGTERM the child's group, grant the grace window, then SIGKILL.
fn terminate_group(child: &mut Child) -> Result<ExitStatus> {
    let pgid = child.id() as libc::pid_t;
    debug!(pgid, "terminating process group");
    // The child is the group leader, so its pid doubles as the pgid.
    unsafe { libc::killpg(pgid, libc::SIGTERM) };
    if let Some(status) = child
        .wait_timeout(KILL_GRACE)
        .context("wait after SIGTERM")?
    {
        return Ok(status);
    }
    unsafe { libc::killpg(pgid, libc::SIGKILL) };
    child.wait().context("wait after SIGKILL")
}

/// Exit code for a finished child: the real code, or -1 when signalled.
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// In-memory capture buffer shared by the tee threads of one phase.
pub type Capture = Arc<Mutex<Vec<u8>>>;

pub fn new_capture() -> Capture {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn capture_string(capture: &Capture) -> String {
    String::from_utf8_lossy(&capture.lock().expect("capture lock poisoned")).into_owned()
}

/// Drain `reader` on a background thread, mirroring every chunk to the
/// terminal writer, the phase log, and (when given) the capture buffer.
pub fn tee<R, W>(
    reader: R,
    mut terminal: W,
    mut log: File,
    capture: Option<Capture>,
) -> JoinHandle<Result<()>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = reader;
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).context("read phase output")?;
            if n == 0 {
                break;
            }
            let bytes = &chunk[..n];
            terminal
                .write_all(bytes)
                .and_then(|()| terminal.flush())
                .context("mirror phase output")?;
            log.write_all(bytes).context("write phase log")?;
            if let Some(capture) = &capture {
                capture
                    .lock()
                    .expect("capture lock poisoned")
                    .extend_from_slice(bytes);
            }
        }
        log.flush().context("flush phase log")?;
        Ok(())
    })
}

/// Join a tee thread, surfacing its I/O errors.
pub fn join_tee(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("output tee thread panicked"))?
}
