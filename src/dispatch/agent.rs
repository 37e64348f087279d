//! Agent phase executor: drives the external LLM CLI over stream-json.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::process::{Command, Stdio};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::Phase;
use crate::dispatch::expand::expand_vars;
use crate::dispatch::process::{self, WaitOutcome, join_tee, spawn_group, tee, wait_with_cancel};
use crate::dispatch::stdin_reader::StdinReader;
use crate::dispatch::stream::{PermissionDenial, StreamResult, process_stream};
use crate::dispatch::{DispatchResult, Environment, phase_deadline, phase_work_dir};
use crate::state::{artifacts, atomic};
use crate::ux;

/// Tools every agent phase may use without manual approval: file and search
/// operations plus task delegation, but no shell.
const DEFAULT_ALLOW_TOOLS: &[&str] = &[
    "Read", "Edit", "Write", "Glob", "Grep", "Task", "WebFetch", "WebSearch",
];

/// Session argument for one agent turn.
#[derive(Debug, Clone, Copy)]
enum Session<'a> {
    /// First turn of a phase: attach a freshly generated id.
    First(&'a str),
    /// Later turn of the same phase: resume the same id.
    Resume(&'a str),
    /// Standalone turn with no session correlation (output re-prompts).
    Fresh,
}

/// Outcome of a single agent turn (one subprocess invocation).
#[derive(Debug)]
struct TurnResult {
    stream: StreamResult,
    exit_code: i32,
}

/// Build the CLI argument list for one turn. Tool permissions merge in
/// order, first-seen wins on duplicates: the hard-coded safe defaults,
/// workflow-wide defaults from configuration, phase additions, and any tools
/// approved interactively during this phase.
fn build_agent_args(
    phase: &Phase,
    prompt: &str,
    session: Session<'_>,
    workflow_tools: &[String],
    extra_tools: &[String],
) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--include-partial-messages".to_string(),
        "--model".to_string(),
        phase.model.clone(),
    ];

    match session {
        Session::First(id) => {
            args.push("--session-id".to_string());
            args.push(id.to_string());
        }
        Session::Resume(id) => {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        Session::Fresh => {}
    }

    let mut tools: Vec<String> = Vec::new();
    let defaults = DEFAULT_ALLOW_TOOLS.iter().map(|t| t.to_string());
    for tool in defaults
        .chain(workflow_tools.iter().cloned())
        .chain(phase.allow_tools.iter().cloned())
        .chain(extra_tools.iter().cloned())
    {
        if !tools.contains(&tool) {
            tools.push(tool);
        }
    }
    if !tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.extend(tools);
    }

    args
}

/// Read the phase's prompt template, expand it, and persist the rendered
/// prompt for inspection. The saved file is byte-identical to the string
/// handed to the CLI.
fn prepare_prompt(phase: &Phase, env: &Environment) -> Result<String> {
    let template_path = env.project_root.join(&phase.prompt);
    let template = std::fs::read_to_string(&template_path)
        .with_context(|| format!("read prompt template {}", template_path.display()))?;
    let rendered = expand_vars(&template, &env.vars());
    atomic::write_atomic(
        &artifacts::prompt_path(&env.artifacts_dir, env.phase_index),
        rendered.as_bytes(),
    )
    .context("save rendered prompt")?;
    Ok(rendered)
}

/// Spawn one CLI turn and process its stream until it exits.
fn run_agent_turn(
    cancel: &CancelToken,
    deadline: Option<Instant>,
    phase: &Phase,
    env: &Environment,
    prompt: &str,
    session: Session<'_>,
    log: &File,
    workflow_tools: &[String],
    extra_tools: &[String],
) -> Result<TurnResult> {
    let args = build_agent_args(phase, prompt, session, workflow_tools, extra_tools);
    debug!(phase = %phase.name, model = %phase.model, "starting agent turn");

    let mut cmd = Command::new("claude");
    cmd.args(&args)
        .current_dir(phase_work_dir(phase, env))
        .env_clear()
        .envs(env.child_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = spawn_group(&mut cmd)?;
    let stdout = child.stdout.take().context("agent stdout was not piped")?;
    let stderr = child.stderr.take().context("agent stderr was not piped")?;

    let stderr_log = log.try_clone().context("clone phase log for stderr")?;
    let stderr_tee = tee(stderr, io::stderr(), stderr_log, None);

    // The stream must drain concurrently with the wait: a full pipe buffer
    // would deadlock the child. The waiter owns the child and enforces
    // cancellation and the deadline via group signals.
    let waiter = {
        let cancel = cancel.clone();
        std::thread::spawn(move || wait_with_cancel(&mut child, &cancel, deadline))
    };

    let mut log_writer = log.try_clone().context("clone phase log for stream")?;
    let stream = process_stream(
        cancel,
        BufReader::new(stdout),
        &mut io::stdout(),
        &mut log_writer,
    );

    let verdict = waiter
        .join()
        .map_err(|_| anyhow!("agent wait thread panicked"))??;
    join_tee(stderr_tee)?;
    let stream = stream?;

    if verdict.outcome == WaitOutcome::TimedOut {
        warn!(phase = %phase.name, timeout_mins = phase.timeout, "agent phase timed out");
    }

    Ok(TurnResult {
        stream,
        exit_code: process::exit_code(verdict.status),
    })
}

/// Execute an agent phase unattended: one turn, denials logged but not
/// retried.
pub fn run_agent(
    cancel: &CancelToken,
    phase: &Phase,
    env: &Environment,
    workflow_tools: &[String],
) -> Result<DispatchResult> {
    let deadline = phase_deadline(phase);
    let rendered = prepare_prompt(phase, env)?;

    let log_path = artifacts::log_path(&env.artifacts_dir, env.phase_index);
    let log = File::create(&log_path)
        .with_context(|| format!("create phase log {}", log_path.display()))?;

    let session_id = Uuid::new_v4().to_string();
    let turn = run_agent_turn(
        cancel,
        deadline,
        phase,
        env,
        &rendered,
        Session::First(&session_id),
        &log,
        workflow_tools,
        &[],
    )?;

    if !turn.stream.permission_denials.is_empty() {
        let names: Vec<String> = turn
            .stream
            .permission_denials
            .iter()
            .map(ToString::to_string)
            .collect();
        eprintln!("  permission denials: {}", names.join(", "));
    }

    Ok(DispatchResult {
        exit_code: turn.exit_code,
        output: turn.stream.text,
    })
}

/// Execute an agent phase with operator steering. A background stdin reader
/// buffers follow-up instructions; after each turn, buffered input resumes
/// the same session, and permission denials offer a y/n approval that retries
/// with the denied tools enabled.
pub fn run_agent_attended(
    cancel: &CancelToken,
    phase: &Phase,
    env: &Environment,
    workflow_tools: &[String],
) -> Result<DispatchResult> {
    let deadline = phase_deadline(phase);
    let rendered = prepare_prompt(phase, env)?;

    let log_path = artifacts::log_path(&env.artifacts_dir, env.phase_index);
    let log = File::create(&log_path)
        .with_context(|| format!("create phase log {}", log_path.display()))?;

    let session_id = Uuid::new_v4().to_string();
    let reader = StdinReader::new(BufReader::new(io::stdin()));
    let mut extra_tools: Vec<String> = Vec::new();
    let mut prompt = rendered;
    let mut first = true;

    let last = loop {
        let session = if first {
            Session::First(&session_id)
        } else {
            Session::Resume(&session_id)
        };
        let turn = run_agent_turn(
            cancel, deadline, phase, env, &prompt, session, &log, workflow_tools, &extra_tools,
        )?;
        first = false;

        if !turn.stream.permission_denials.is_empty() && !cancel.is_cancelled() {
            let approved = handle_denials(&turn.stream.permission_denials, &reader, cancel);
            if !approved.is_empty() {
                extra_tools.extend(approved);
                prompt =
                    "Continue — the previously denied tools have now been approved.".to_string();
                continue;
            }
        }

        if let Some(line) = reader.try_line() {
            writeln!(&log, "\n--- user steering: {line} ---").context("log steering input")?;
            prompt = line;
            continue;
        }

        break turn;
    };

    Ok(DispatchResult {
        exit_code: last.exit_code,
        output: last.stream.text,
    })
}

/// One extra turn with a caller-supplied prompt, appending to the phase log.
/// Starts a fresh session so the directive cannot steer the original
/// conversation.
pub fn run_agent_with_prompt(
    cancel: &CancelToken,
    phase: &Phase,
    env: &Environment,
    workflow_tools: &[String],
    prompt: &str,
) -> Result<DispatchResult> {
    let deadline = phase_deadline(phase);

    let log_path = artifacts::log_path(&env.artifacts_dir, env.phase_index);
    let log = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&log_path)
        .with_context(|| format!("open phase log {}", log_path.display()))?;

    let turn = run_agent_turn(
        cancel,
        deadline,
        phase,
        env,
        prompt,
        Session::Fresh,
        &log,
        workflow_tools,
        &[],
    )?;

    Ok(DispatchResult {
        exit_code: turn.exit_code,
        output: turn.stream.text,
    })
}

/// Show denied tools and ask whether to retry with them approved. Returns the
/// approved tool names (empty when declined or cancelled).
fn handle_denials(
    denials: &[PermissionDenial],
    reader: &StdinReader,
    cancel: &CancelToken,
) -> Vec<String> {
    let names: Vec<String> = denials.iter().map(ToString::to_string).collect();
    for denial in denials {
        ux::tool_denied(&denial.tool, &denial.input);
    }
    ux::permission_prompt(&names);
    print!("  Retry with these tools approved? [y/n]: ");
    let _ = io::stdout().flush();

    match reader.wait_line(cancel) {
        Some(answer) if matches!(answer.to_lowercase().as_str(), "y" | "yes") => denials
            .iter()
            .map(|denial| denial.tool.clone())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseType;
    use std::path::Path;

    fn agent_phase() -> Phase {
        Phase {
            name: "plan".to_string(),
            phase_type: Some(PhaseType::Agent),
            prompt: "prompts/plan.md".to_string(),
            model: "sonnet".to_string(),
            ..Phase::default()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn args_request_stream_json_with_model() {
        let args = build_agent_args(&agent_phase(), "do it", Session::Fresh, &[], &[]);
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--include-partial-messages"));
        assert!(joined.contains("--model sonnet"));
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "do it");
    }

    #[test]
    fn first_turn_attaches_session_id_later_turns_resume() {
        let first = build_agent_args(&agent_phase(), "p", Session::First("abc"), &[], &[]);
        assert!(first.join(" ").contains("--session-id abc"));
        assert!(!first.join(" ").contains("--resume"));

        let resume = build_agent_args(&agent_phase(), "p", Session::Resume("abc"), &[], &[]);
        assert!(resume.join(" ").contains("--resume abc"));
        assert!(!resume.join(" ").contains("--session-id"));

        let fresh = build_agent_args(&agent_phase(), "p", Session::Fresh, &[], &[]);
        let joined = fresh.join(" ");
        assert!(!joined.contains("--session-id"));
        assert!(!joined.contains("--resume"));
    }

    /// Merging keeps first-seen order and drops duplicates across the three
    /// permission sources.
    #[test]
    fn tool_permissions_merge_in_order_without_duplicates() {
        let mut phase = agent_phase();
        phase.allow_tools = strings(&["Bash", "Read"]);
        let args = build_agent_args(
            &phase,
            "p",
            Session::Fresh,
            &strings(&["WebSearch", "NotebookEdit"]),
            &strings(&["Bash", "KillShell"]),
        );

        let at = args
            .iter()
            .position(|a| a == "--allowedTools")
            .expect("allowedTools flag");
        let tools: Vec<&str> = args[at + 1..].iter().map(String::as_str).collect();
        assert_eq!(
            tools,
            vec![
                "Read",
                "Edit",
                "Write",
                "Glob",
                "Grep",
                "Task",
                "WebFetch",
                "WebSearch",
                "NotebookEdit",
                "Bash",
                "KillShell",
            ]
        );
    }

    #[test]
    fn rendered_prompt_on_disk_matches_the_cli_argument() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::create_dir_all(root.join("prompts")).expect("mkdir");
        std::fs::write(
            root.join("prompts/plan.md"),
            "Plan work for $TICKET in ${WORK_DIR}.\n",
        )
        .expect("write template");

        let artifacts_dir = root.join("artifacts");
        artifacts::ensure_tree(&artifacts_dir).expect("ensure tree");
        let env = Environment {
            project_root: root.to_path_buf(),
            work_dir: root.to_path_buf(),
            artifacts_dir: artifacts_dir.clone(),
            ticket: "PROJ-12".to_string(),
            phase_index: 2,
            phase_count: 3,
            ..Environment::default()
        };

        let rendered = prepare_prompt(&agent_phase(), &env).expect("prepare");
        assert_eq!(
            rendered,
            format!("Plan work for PROJ-12 in {}.\n", root.display())
        );

        let saved = std::fs::read(artifacts::prompt_path(&artifacts_dir, 2)).expect("read");
        assert_eq!(saved, rendered.as_bytes());
        assert!(
            Path::new(&artifacts::prompt_path(&artifacts_dir, 2))
                .ends_with("prompts/phase-3.md")
        );
    }

    #[test]
    fn missing_template_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts_dir = temp.path().join("artifacts");
        artifacts::ensure_tree(&artifacts_dir).expect("ensure tree");
        let env = Environment {
            project_root: temp.path().to_path_buf(),
            artifacts_dir,
            ..Environment::default()
        };
        let err = prepare_prompt(&agent_phase(), &env).expect_err("missing template");
        assert!(format!("{err:#}").contains("prompt template"));
    }
}
