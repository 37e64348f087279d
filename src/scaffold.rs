//! `orc init`: create a starter `.orc/` directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

const EXAMPLE_CONFIG: &str = r#"name: example-workflow
ticket-pattern: '[A-Z]+-\d+'

vars:
  BRANCH: work/$TICKET

default-allow-tools: []

phases:
  - name: plan
    type: agent
    description: Draft an implementation plan
    prompt: .orc/prompts/plan.md
    model: opus
    outputs: [plan.md]

  - name: approve-plan
    type: gate
    description: Review plan.md before implementation starts

  - name: implement
    type: agent
    description: Implement the plan
    prompt: .orc/prompts/implement.md
    model: sonnet
    allow-tools: [Bash]
    timeout: 60

  - name: verify
    type: script
    description: Run the test suite
    run: cd $WORK_DIR && make test
    on-fail:
      goto: implement
      max: 2
"#;

const PLAN_PROMPT: &str = r#"Plan the work for ticket $TICKET.

Write the finished plan to $ARTIFACTS_DIR/plan.md.

If a previous attempt failed, its output is under $ARTIFACTS_DIR/feedback/;
read any files there before planning.
"#;

const IMPLEMENT_PROMPT: &str = r#"Implement the plan in $ARTIFACTS_DIR/plan.md for ticket $TICKET.

Work in $WORK_DIR. If $ARTIFACTS_DIR/feedback/ contains files, a later phase
rejected an earlier attempt; address that feedback first.
"#;

/// Create `.orc/config.yaml` and starter prompt templates under `dir`.
/// Refuses to clobber an existing config.
pub fn init(dir: &Path) -> Result<()> {
    let orc_dir = dir.join(".orc");
    let config_path = orc_dir.join("config.yaml");
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let prompts_dir = orc_dir.join("prompts");
    fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create {}", prompts_dir.display()))?;

    fs::write(&config_path, EXAMPLE_CONFIG)
        .with_context(|| format!("write {}", config_path.display()))?;
    write_if_missing(&prompts_dir.join("plan.md"), PLAN_PROMPT)?;
    write_if_missing(&prompts_dir.join("implement.md"), IMPLEMENT_PROMPT)?;

    println!("Created {}", config_path.display());
    println!("Edit the config, then start a run with: orc run <ticket>");
    Ok(())
}

fn write_if_missing(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn init_creates_a_loadable_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init(temp.path()).expect("init");

        let cfg = config::load(&temp.path().join(".orc/config.yaml"), temp.path())
            .expect("scaffolded config must validate");
        assert_eq!(cfg.name, "example-workflow");
        assert_eq!(cfg.phases.len(), 4);
    }

    #[test]
    fn init_refuses_to_clobber() {
        let temp = tempfile::tempdir().expect("tempdir");
        init(temp.path()).expect("init");
        let err = init(temp.path()).expect_err("second init must fail");
        assert!(err.to_string().contains("already exists"));
    }
}
