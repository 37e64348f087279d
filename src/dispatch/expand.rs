//! Template substitution with layered scopes.

use std::collections::{BTreeMap, HashMap};

use crate::config::OrderedVars;

/// Substitute `$NAME` and `${NAME}` occurrences against `vars`, falling back
/// to the process environment. Unknown names expand to empty. Anything that
/// does not form a variable reference passes through unchanged.
pub fn expand_vars(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(close) => {
                    out.push_str(&lookup(&braced[..close], vars));
                    rest = &braced[close + 1..];
                }
                None => {
                    // Unclosed brace: keep the text literally.
                    out.push_str("${");
                    rest = braced;
                }
            }
            continue;
        }

        let starts_name = after
            .chars()
            .next()
            .is_some_and(|c| c == '_' || c.is_ascii_alphabetic());
        if !starts_name {
            out.push('$');
            rest = after;
            continue;
        }
        let name_len = after
            .find(|c: char| c != '_' && !c.is_ascii_alphanumeric())
            .unwrap_or(after.len());
        out.push_str(&lookup(&after[..name_len], vars));
        rest = &after[name_len..];
    }

    out.push_str(rest);
    out
}

fn lookup(name: &str, vars: &HashMap<String, String>) -> String {
    if let Some(value) = vars.get(name) {
        return value.clone();
    }
    std::env::var(name).unwrap_or_default()
}

/// Resolve the configuration's declaration-ordered variable list into a flat
/// map. Each entry is expanded against the built-ins plus all previously
/// resolved entries, so later entries may reference earlier ones; the process
/// environment is the outermost fallback.
pub fn resolve_config_vars(
    entries: &OrderedVars,
    base: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut scope = base.clone();
    let mut resolved = BTreeMap::new();
    for entry in &entries.0 {
        let value = expand_vars(&entry.value, &scope);
        scope.insert(entry.key.clone(), value.clone());
        resolved.insert(entry.key.clone(), value);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VarEntry;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_both_reference_forms() {
        let map = vars(&[("NAME", "world")]);
        assert_eq!(expand_vars("hello $NAME", &map), "hello world");
        assert_eq!(expand_vars("hello ${NAME}!", &map), "hello world!");
    }

    #[test]
    fn unknown_names_expand_to_empty() {
        let map = vars(&[]);
        assert_eq!(
            expand_vars("x${DEFINITELY_NOT_SET_ANYWHERE_123}y", &map),
            "xy"
        );
    }

    #[test]
    fn idempotent_without_dollar_signs() {
        let map = vars(&[("A", "a")]);
        let text = "no references here, just text";
        assert_eq!(expand_vars(text, &map), text);
    }

    #[test]
    fn falls_back_to_process_environment() {
        let map = vars(&[]);
        let path = std::env::var("PATH").expect("PATH is set in tests");
        assert_eq!(expand_vars("$PATH", &map), path);
    }

    #[test]
    fn map_entries_shadow_the_process_environment() {
        let map = vars(&[("PATH", "/overridden")]);
        assert_eq!(expand_vars("$PATH", &map), "/overridden");
    }

    #[test]
    fn literal_dollar_without_name_passes_through() {
        let map = vars(&[]);
        assert_eq!(expand_vars("cost: $5", &map), "cost: $5");
        assert_eq!(expand_vars("trailing $", &map), "trailing $");
    }

    #[test]
    fn name_stops_at_non_identifier_characters() {
        let map = vars(&[("A", "1")]);
        assert_eq!(expand_vars("$A/b", &map), "1/b");
    }

    #[test]
    fn ordered_resolution_lets_later_entries_reference_earlier() {
        let entries = OrderedVars(vec![
            VarEntry {
                key: "A".to_string(),
                value: "x".to_string(),
            },
            VarEntry {
                key: "B".to_string(),
                value: "$A/y".to_string(),
            },
        ]);
        let resolved = resolve_config_vars(&entries, &HashMap::new());
        assert_eq!(resolved["A"], "x");
        assert_eq!(resolved["B"], "x/y");
    }

    #[test]
    fn ordered_resolution_sees_builtins() {
        let entries = OrderedVars(vec![VarEntry {
            key: "REPORT".to_string(),
            value: "$TICKET-report.md".to_string(),
        }]);
        let base = vars(&[("TICKET", "PROJ-3")]);
        let resolved = resolve_config_vars(&entries, &base);
        assert_eq!(resolved["REPORT"], "PROJ-3-report.md");
    }
}
