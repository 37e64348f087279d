//! Workflow configuration (`.orc/config.yaml`): types, loading, validation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Deserializer, de};

/// Variable names built into every run. Custom vars may not shadow these.
pub const BUILTIN_VARS: &[&str] = &[
    "TICKET",
    "ARTIFACTS_DIR",
    "WORK_DIR",
    "PROJECT_ROOT",
    "PHASE_INDEX",
    "PHASE_COUNT",
];

static VAR_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("var name regex is valid"));

/// Kind of work a phase performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseType {
    /// Shell command run through `bash -c`.
    Script,
    /// External LLM CLI invocation.
    Agent,
    /// Interactive human approval.
    Gate,
}

/// Bounded backward jump applied when a phase fails.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OnFail {
    /// Name of the (strictly earlier) phase to re-enter.
    #[serde(rename = "goto", default)]
    pub target: String,
    /// Maximum on-fail jumps from this phase before the run fails terminally.
    #[serde(default)]
    pub max: u32,
}

/// One named unit of work. Immutable once the configuration is loaded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub phase_type: Option<PhaseType>,
    #[serde(default)]
    pub description: String,
    /// Command text (script phases).
    #[serde(default)]
    pub run: String,
    /// Prompt template path relative to the project root (agent phases).
    #[serde(default)]
    pub prompt: String,
    /// Model selector: opus, sonnet, or haiku. Empty defaults to opus.
    #[serde(default)]
    pub model: String,
    /// Timeout in minutes. 0 or unset picks the type default (agent 30,
    /// script 10).
    #[serde(default)]
    pub timeout: u64,
    /// Bare filenames the phase promises to produce under the artifacts root.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Gating shell command; non-zero exit skips the phase.
    #[serde(default)]
    pub condition: String,
    /// Name of a strictly later phase to run concurrently with this one.
    #[serde(rename = "parallel-with", default)]
    pub parallel_with: String,
    #[serde(rename = "on-fail", default)]
    pub on_fail: Option<OnFail>,
    /// Working-directory template, expanded with the full variable map.
    #[serde(default)]
    pub cwd: String,
    /// Additional tool permissions (agent phases only).
    #[serde(rename = "allow-tools", default)]
    pub allow_tools: Vec<String>,
}

/// A single `vars` entry. Declaration order is significant: later entries may
/// reference earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarEntry {
    pub key: String,
    pub value: String,
}

/// Declaration-ordered variable list. Parsed from a YAML mapping node rather
/// than an unordered map so the order survives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedVars(pub Vec<VarEntry>);

impl<'de> Deserialize<'de> for OrderedVars {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in &mapping {
            let key = scalar_to_string(key)
                .ok_or_else(|| de::Error::custom("vars: key is not a scalar"))?;
            let value = scalar_to_string(value).ok_or_else(|| {
                de::Error::custom(format!(
                    "vars: value for {key:?} is not a scalar (nested sequences and maps are not supported)"
                ))
            })?;
            entries.push(VarEntry { key, value });
        }
        Ok(OrderedVars(entries))
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

/// A full workflow definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub name: String,
    /// Regex a ticket must match in full. Empty accepts any ticket.
    #[serde(rename = "ticket-pattern", default)]
    pub ticket_pattern: String,
    #[serde(default)]
    pub vars: OrderedVars,
    /// Tool permissions granted to every agent phase.
    #[serde(rename = "default-allow-tools", default)]
    pub default_allow_tools: Vec<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

impl Config {
    /// Index of the named phase in declaration order.
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|phase| phase.name == name)
    }
}

/// Read a YAML config file and return a validated `Config` with defaults
/// applied.
pub fn load(path: &Path, project_root: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut cfg: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parse config {}", path.display()))?;
    validate(&mut cfg, project_root)?;
    Ok(cfg)
}

/// Check the config for errors and fill in per-type defaults.
pub fn validate(cfg: &mut Config, project_root: &Path) -> Result<()> {
    if cfg.name.is_empty() {
        bail!("config: 'name' is required");
    }
    if cfg.phases.is_empty() {
        bail!("config: at least one phase is required");
    }

    let mut seen_vars = HashSet::new();
    for entry in &cfg.vars.0 {
        if entry.key.is_empty() {
            bail!("config: vars: empty variable name");
        }
        if !VAR_NAME_RE.is_match(&entry.key) {
            bail!(
                "config: vars: {:?} is not a valid variable name (must match [A-Za-z_][A-Za-z0-9_]*)",
                entry.key
            );
        }
        if BUILTIN_VARS.contains(&entry.key.as_str()) {
            bail!("config: vars: {:?} overrides a built-in variable", entry.key);
        }
        if !seen_vars.insert(entry.key.clone()) {
            bail!("config: vars: duplicate variable {:?}", entry.key);
        }
    }

    for tool in &cfg.default_allow_tools {
        if tool.trim().is_empty() {
            bail!("config: 'default-allow-tools' entries must be non-empty");
        }
    }

    let names: Vec<String> = cfg.phases.iter().map(|phase| phase.name.clone()).collect();
    let mut seen = HashSet::new();
    for i in 0..cfg.phases.len() {
        let phase = &mut cfg.phases[i];

        if phase.name.is_empty() {
            bail!("config: phase {}: 'name' is required", i + 1);
        }
        if !seen.insert(phase.name.clone()) {
            bail!("config: duplicate phase name {:?}", phase.name);
        }

        let Some(kind) = phase.phase_type else {
            bail!("config: phase {:?}: 'type' is required", phase.name);
        };

        match kind {
            PhaseType::Agent => {
                if phase.prompt.is_empty() {
                    bail!("config: agent phase {:?}: 'prompt' is required", phase.name);
                }
                let prompt_path = project_root.join(&phase.prompt);
                if !prompt_path.exists() {
                    bail!(
                        "config: agent phase {:?}: prompt file {:?} not found",
                        phase.name,
                        prompt_path
                    );
                }
                if phase.model.is_empty() {
                    phase.model = "opus".to_string();
                }
                if phase.timeout == 0 {
                    phase.timeout = 30;
                }
            }
            PhaseType::Script => {
                if phase.run.is_empty() {
                    bail!("config: script phase {:?}: 'run' is required", phase.name);
                }
                if phase.timeout == 0 {
                    phase.timeout = 10;
                }
            }
            PhaseType::Gate => {
                if !phase.cwd.is_empty() {
                    bail!(
                        "config: gate phase {:?}: 'cwd' is not supported on gate phases",
                        phase.name
                    );
                }
            }
        }

        if !phase.allow_tools.is_empty() && kind != PhaseType::Agent {
            bail!(
                "config: phase {:?}: 'allow-tools' is only valid on agent phases",
                phase.name
            );
        }
        for tool in &phase.allow_tools {
            if tool.trim().is_empty() {
                bail!(
                    "config: phase {:?}: 'allow-tools' entries must be non-empty",
                    phase.name
                );
            }
        }

        if !matches!(phase.model.as_str(), "" | "opus" | "sonnet" | "haiku") {
            bail!(
                "config: phase {:?}: unknown model {:?} (must be opus, sonnet, or haiku)",
                phase.name,
                phase.model
            );
        }

        for output in &phase.outputs {
            if output.contains('/') || output.contains(std::path::MAIN_SEPARATOR) {
                bail!(
                    "config: phase {:?}: output {:?} must not contain path separators",
                    phase.name,
                    output
                );
            }
        }

        if let Some(on_fail) = &mut phase.on_fail {
            if on_fail.target.is_empty() {
                bail!("config: phase {:?}: on-fail.goto is required", phase.name);
            }
            if !names[..i].contains(&on_fail.target) {
                bail!(
                    "config: phase {:?}: on-fail.goto {:?} must reference an earlier phase",
                    phase.name,
                    on_fail.target
                );
            }
            if on_fail.max == 0 {
                on_fail.max = 2;
            }
        }

        if !phase.parallel_with.is_empty() {
            let name = phase.name.clone();
            let partner_name = phase.parallel_with.clone();
            let has_on_fail = phase.on_fail.is_some();
            let Some(partner_idx) = names.iter().position(|n| *n == partner_name) else {
                bail!(
                    "config: phase {name:?}: parallel-with {partner_name:?} references unknown phase"
                );
            };
            // The partner must come later in declaration order, so the pair
            // is always entered through the declaring phase.
            if partner_idx <= i {
                bail!(
                    "config: phase {name:?}: parallel-with {partner_name:?} must reference a later phase"
                );
            }
            if has_on_fail || cfg.phases[partner_idx].on_fail.is_some() {
                bail!("config: phase {name:?}: parallel-with and on-fail cannot be combined");
            }
        }
    }

    Ok(())
}

/// Check that the ticket matches the configured pattern (full-match). An
/// empty pattern accepts any ticket.
pub fn validate_ticket(pattern: &str, ticket: &str) -> Result<()> {
    if pattern.is_empty() {
        return Ok(());
    }
    let anchored = if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^(?:{pattern})$")
    };
    let re = Regex::new(&anchored)
        .map_err(|err| anyhow!("config: invalid ticket-pattern {pattern:?}: {err}"))?;
    if !re.is_match(ticket) {
        bail!("ticket {ticket:?} does not match pattern {pattern:?}");
    }
    Ok(())
}
