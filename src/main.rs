//! Deterministic workflow orchestrator CLI.
//!
//! A supervisor process owns the phase state machine: each phase runs as an
//! isolated subprocess (shell command, LLM CLI, or human gate) and context
//! moves between phases through files in a per-run artifacts directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use orc::cancel::CancelToken;
use orc::config;
use orc::dispatch::{DefaultDispatcher, Environment, SELF_NESTING_MARKER, expand, preflight};
use orc::runner::{self, Runner};
use orc::state::run_state::{RunStatus, load_state, save_state};
use orc::state::artifacts;
use orc::{exit_codes, logging, scaffold, ux};

#[derive(Parser)]
#[command(
    name = "orc",
    version,
    about = "Deterministic multi-phase workflow orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workflow for a ticket.
    Run {
        ticket: String,
        /// Skip human gates and agent steering.
        #[arg(long)]
        auto: bool,
        /// Retry from phase N (1-indexed). Resets loop counts.
        #[arg(long, conflicts_with = "from")]
        retry: Option<usize>,
        /// Start from phase N (1-indexed). Resets loop counts.
        #[arg(long)]
        from: Option<usize>,
        /// Print the phase plan without executing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show workflow status for a ticket.
    Status { ticket: String },
    /// Create a .orc/ directory with an example workflow.
    Init,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{}error:{} {err:#}", ux::RED, ux::RESET);
        std::process::exit(exit_codes::FAILURE);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            ticket,
            auto,
            retry,
            from,
            dry_run,
        } => cmd_run(&ticket, auto, retry, from, dry_run),
        Command::Status { ticket } => cmd_status(&ticket),
        Command::Init => scaffold::init(&std::env::current_dir().context("resolve cwd")?),
    }
}

fn cmd_run(
    ticket: &str,
    auto: bool,
    retry: Option<usize>,
    from: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if std::env::var_os(SELF_NESTING_MARKER).is_some() {
        bail!(
            "orc cannot run inside an agent session ({SELF_NESTING_MARKER} env var is set). Run from a regular terminal"
        );
    }

    let project_root = find_project_root()?;
    let config_path = project_root.join(".orc").join("config.yaml");
    let cfg = config::load(&config_path, &project_root).context("loading config")?;
    config::validate_ticket(&cfg.ticket_pattern, ticket)?;

    let artifacts_dir = project_root.join(".orc").join("artifacts");
    let mut env = Environment {
        project_root: project_root.clone(),
        work_dir: project_root,
        artifacts_dir: artifacts_dir.clone(),
        ticket: ticket.to_string(),
        phase_count: cfg.phases.len(),
        auto_mode: auto,
        ..Environment::default()
    };
    if !cfg.vars.0.is_empty() {
        env.custom_vars = expand::resolve_config_vars(&cfg.vars, &env.vars());
    }

    let mut state = load_state(&artifacts_dir).context("loading state")?;
    state.ticket = ticket.to_string();
    state.status = RunStatus::Running;

    for (flag, value) in [("--retry", retry), ("--from", from)] {
        if let Some(n) = value {
            if n == 0 || n > cfg.phases.len() {
                bail!(
                    "{flag} {n} is out of range (workflow has {} phases)",
                    cfg.phases.len()
                );
            }
            state.set_phase(n - 1);
        }
    }
    if retry.is_some() || from.is_some() {
        artifacts::ensure_tree(&artifacts_dir)?;
        runner::reset_loop_counts(&artifacts_dir)?;
    }

    preflight::preflight(&cfg.phases)?;

    let dispatcher = DefaultDispatcher {
        default_allow_tools: cfg.default_allow_tools.clone(),
    };
    let mut workflow = Runner::new(cfg, state, env, dispatcher);

    if dry_run {
        workflow.dry_run_print();
        return Ok(());
    }

    artifacts::ensure_tree(&artifacts_dir)?;
    save_state(&artifacts_dir, &workflow.state)?;

    let cancel = CancelToken::new();
    cancel.register_signals()?;

    workflow.run(&cancel)
}

fn cmd_status(ticket: &str) -> Result<()> {
    let project_root = find_project_root()?;
    let config_path = project_root.join(".orc").join("config.yaml");
    let cfg = config::load(&config_path, &project_root).context("loading config")?;

    let artifacts_dir = project_root.join(".orc").join("artifacts");
    let state = load_state(&artifacts_dir).context("loading state")?;

    if !state.ticket.is_empty() && state.ticket != ticket {
        bail!("state is for ticket {:?}, not {ticket:?}", state.ticket);
    }

    ux::render_status(&cfg, &state, &artifacts_dir);
    Ok(())
}

/// Walk up from the current directory looking for `.orc/config.yaml`.
fn find_project_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("resolve cwd")?;
    let mut dir: &Path = &cwd;
    loop {
        if dir.join(".orc").join("config.yaml").exists() {
            return Ok(dir.to_path_buf());
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => bail!("no .orc/config.yaml found (searched from cwd to root)"),
        }
    }
}
