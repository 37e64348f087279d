//! Terminal rendering for run progress and status.
//!
//! Product output (what the operator watches) goes through these helpers to
//! stdout; diagnostics go through `tracing` to stderr.

use std::path::Path;
use std::time::Duration;

use chrono::Local;

use crate::config::{Config, Phase, PhaseType};
use crate::state::run_state::RunState;
use crate::state::timing::Timing;

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn mins_secs(duration: Duration) -> (u64, u64) {
    let secs = duration.as_secs();
    (secs / 60, secs % 60)
}

/// Print a timestamped phase header.
pub fn phase_header(index: usize, total: usize, phase: &Phase) {
    let ts = timestamp();
    println!("\n{DIM}[{ts}]{RESET} {CYAN}══════════════════════════════════════{RESET}");
    let desc = if phase.description.is_empty() {
        String::new()
    } else {
        format!(" — {}", phase.description)
    };
    let kind = match phase.phase_type {
        Some(PhaseType::Script) => "script",
        Some(PhaseType::Agent) => "agent",
        Some(PhaseType::Gate) => "gate",
        None => "unknown",
    };
    println!(
        "{DIM}[{ts}]{RESET}  {BOLD}Phase {}/{}: {} ({kind}){desc}{RESET}",
        index + 1,
        total,
        phase.name
    );
    println!("{DIM}[{ts}]{RESET} {CYAN}══════════════════════════════════════{RESET}");
}

pub fn phase_complete(index: usize, duration: Duration) {
    let (m, s) = mins_secs(duration);
    println!(
        "{DIM}[{}]{RESET}  {GREEN}✓ Phase {} complete ({m}m {s:02}s){RESET}",
        timestamp(),
        index + 1
    );
}

pub fn phase_fail(index: usize, phase_name: &str, err_msg: &str) {
    println!(
        "{DIM}[{}]{RESET}  {RED}✗ Phase {} ({phase_name}) failed: {err_msg}{RESET}",
        timestamp(),
        index + 1
    );
}

pub fn phase_skip(index: usize, phase_name: &str) {
    println!(
        "{DIM}[{}]{RESET}  {DIM}– Phase {} ({phase_name}) skipped (condition not met){RESET}",
        timestamp(),
        index + 1
    );
}

pub fn loop_back(from_phase: &str, to_phase: &str, attempt: u32, max: u32) {
    println!(
        "{DIM}[{}]{RESET}  {YELLOW}↺ Phase {from_phase:?} failed. Looping back to {to_phase:?} (attempt {attempt}/{max}){RESET}",
        timestamp()
    );
}

pub fn resume_hint(ticket: &str) {
    println!("\n{YELLOW}Resume:{RESET} orc run {ticket}");
}

pub fn success(total: usize) {
    println!(
        "\n{DIM}[{}]{RESET}  {BOLD}{GREEN}══ All {total} phases complete ══{RESET}\n",
        timestamp()
    );
}

/// One-line notice for a finalized tool invocation, ready to write to the
/// stream display.
pub fn tool_use_line(name: &str, summary: &str) -> String {
    format!("  {CYAN}⚡ {name}{RESET} {}\n", clip(summary, 80))
}

pub fn tool_denied(name: &str, input: &str) {
    println!("  {RED}✗ {name}(denied){RESET} {}", clip(input, 80));
}

pub fn permission_prompt(tools: &[String]) {
    println!("\n  {YELLOW}⚠ Tools denied: {}{RESET}", tools.join(", "));
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{clipped}...")
}

/// Print the full status display for a ticket.
pub fn render_status(cfg: &Config, state: &RunState, artifacts_dir: &Path) {
    let timing = Timing::load(artifacts_dir).unwrap_or_default();
    let entries = timing.entries();

    println!("{BOLD}Ticket:{RESET}  {}", state.ticket);
    if state.phase_index >= cfg.phases.len() {
        println!("{BOLD}State:{RESET}   {GREEN}{BOLD}completed{RESET}");
    } else {
        let phase = &cfg.phases[state.phase_index];
        println!(
            "{BOLD}State:{RESET}   {}/{} ({}) — {:?}",
            state.phase_index + 1,
            cfg.phases.len(),
            phase.name,
            state.status
        );
    }

    if state.phase_index > 0 {
        println!("\n{BOLD}Completed:{RESET}");
        for (i, phase) in cfg.phases.iter().enumerate().take(state.phase_index) {
            let duration = entries
                .iter()
                .rev()
                .find(|entry| entry.phase == phase.name && entry.duration.is_some())
                .and_then(|entry| entry.duration.clone())
                .map(|d| format!("({d})"))
                .unwrap_or_default();
            println!(
                "  {DIM}{}{RESET}  {:<20} {GREEN}done{RESET}  {duration}",
                i + 1,
                phase.name
            );
        }
    }

    if state.phase_index < cfg.phases.len() {
        println!("\n{BOLD}Remaining:{RESET}");
        for (i, phase) in cfg.phases.iter().enumerate().skip(state.phase_index) {
            let marker = if i == state.phase_index {
                format!("{YELLOW}→{RESET} ")
            } else {
                "  ".to_string()
            };
            let kind = match phase.phase_type {
                Some(PhaseType::Script) => "script",
                Some(PhaseType::Agent) => "agent",
                Some(PhaseType::Gate) => "gate",
                None => "unknown",
            };
            println!(
                "  {marker}{DIM}{}{RESET}  {:<20} {DIM}({kind}){RESET}",
                i + 1,
                phase.name
            );
        }
    }

    println!("\n{BOLD}Artifacts:{RESET}");
    let Ok(entries) = std::fs::read_dir(artifacts_dir) else {
        println!("  {DIM}(none){RESET}\n");
        return;
    };
    let mut names: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| (entry.path(), entry.file_name().to_string_lossy().into_owned()))
        .collect();
    names.sort_by(|a, b| a.1.cmp(&b.1));
    for (path, name) in names {
        if path.is_dir() {
            let mut children: Vec<String> = std::fs::read_dir(&path)
                .map(|dir| {
                    dir.filter_map(|entry| entry.ok())
                        .map(|entry| entry.file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            children.sort();
            match (children.first(), children.last()) {
                (Some(first), Some(last)) if first == last => {
                    println!("  {}/{name}/{first}", artifacts_dir.display());
                }
                (Some(first), Some(last)) => {
                    println!("  {}/{name}/{first} .. {last}", artifacts_dir.display());
                }
                _ => {}
            }
        } else {
            println!("  {}/{name}", artifacts_dir.display());
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_leaves_short_text_alone() {
        assert_eq!(clip("short", 80), "short");
    }

    #[test]
    fn clip_truncates_long_text_with_ellipsis() {
        let long = "a".repeat(100);
        let clipped = clip(&long, 80);
        assert_eq!(clipped.chars().count(), 80);
        assert!(clipped.ends_with("..."));
    }

    #[test]
    fn tool_use_line_names_the_tool() {
        let line = tool_use_line("Bash", "cargo check");
        assert!(line.contains("Bash"));
        assert!(line.contains("cargo check"));
        assert!(line.ends_with('\n'));
    }
}
