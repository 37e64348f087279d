//! Line-oriented JSON event processing for the agent CLI's stream output.
//!
//! The CLI emits one JSON event per line. Text deltas are forwarded to the
//! display and the phase log as they arrive (real-time streaming) while being
//! accumulated as the phase's captured output. Tool invocations arrive as a
//! `content_block_start` announcement followed by incremental JSON deltas; the
//! finalized input is summarized as a one-line notice. The terminal `result`
//! event carries the final cost, session id, and any permission denials.
//!
//! The CLI may interleave plain prose with the JSON stream, so lines that fail
//! to parse are skipped silently, and malformed inner payloads never abort the
//! scan.

use std::fmt;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::ux;

/// A tool invocation rejected by the CLI's permission system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenial {
    pub tool: String,
    pub input: String,
}

impl fmt::Display for PermissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.input.is_empty() {
            write!(f, "{}", self.tool)
        } else {
            write!(f, "{}({})", self.tool, self.input)
        }
    }
}

/// Parsed outcome of one agent CLI invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamResult {
    /// Accumulated assistant text; becomes the phase's captured output.
    pub text: String,
    pub permission_denials: Vec<PermissionDenial>,
    pub cost_usd: f64,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    event: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Default, Deserialize)]
struct InnerEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content_block: Option<ContentBlock>,
    #[serde(default)]
    delta: Option<DeltaBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    partial_json: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultPayload {
    #[serde(default)]
    permission_denials: Vec<DenialEntry>,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    session_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct DenialEntry {
    #[serde(default)]
    tool_name: String,
    #[serde(default)]
    input: String,
}

/// Pending tool invocation being assembled from incremental JSON deltas.
#[derive(Debug, Default)]
struct ToolAccumulator {
    name: Option<String>,
    json: String,
}

/// Read stream-json lines until EOF or cancellation, routing text to
/// `display` and `log` as it arrives. On cancellation the partial result is
/// returned; the caller's group termination closes the pipe.
pub fn process_stream<R: BufRead>(
    cancel: &CancelToken,
    mut reader: R,
    display: &mut dyn Write,
    log: &mut dyn Write,
) -> Result<StreamResult> {
    let mut result = StreamResult::default();
    let mut text = String::new();
    let mut tool = ToolAccumulator::default();
    let mut line = String::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        line.clear();
        let n = reader.read_line(&mut line).context("read agent stream")?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<StreamEvent>(trimmed) else {
            // Interleaved prose; not an event.
            continue;
        };

        match event.kind.as_str() {
            "stream_event" => {
                handle_stream_event(event.event, &mut text, &mut tool, display, log)?;
            }
            "assistant" => {
                // Complete blocks were already surfaced through their deltas.
            }
            "user" => {
                if event.is_error {
                    debug!("user event flagged an error");
                }
            }
            "result" => handle_result_event(&event, &mut result),
            _ => {}
        }
    }

    result.text = text;
    Ok(result)
}

fn handle_stream_event(
    event: Option<Value>,
    text: &mut String,
    tool: &mut ToolAccumulator,
    display: &mut dyn Write,
    log: &mut dyn Write,
) -> Result<()> {
    let Some(event) = event else {
        return Ok(());
    };
    let Ok(inner) = serde_json::from_value::<InnerEvent>(event) else {
        return Ok(());
    };

    match inner.kind.as_str() {
        "content_block_start" => {
            if let Some(block) = &inner.content_block {
                if block.kind == "tool_use" {
                    tool.name = Some(block.name.clone());
                    tool.json.clear();
                }
            }
        }
        "content_block_delta" => {
            let Some(delta) = &inner.delta else {
                return Ok(());
            };
            match delta.kind.as_str() {
                "text_delta" => {
                    text.push_str(&delta.text);
                    display
                        .write_all(delta.text.as_bytes())
                        .and_then(|()| display.flush())
                        .context("mirror assistant text")?;
                    log.write_all(delta.text.as_bytes())
                        .context("log assistant text")?;
                }
                "input_json_delta" => tool.json.push_str(&delta.partial_json),
                _ => {}
            }
        }
        "content_block_stop" => {
            if let Some(name) = tool.name.take() {
                let summary = tool_summary(&name, &tool.json);
                display
                    .write_all(ux::tool_use_line(&name, &summary).as_bytes())
                    .context("print tool notice")?;
                tool.json.clear();
            }
        }
        _ => {}
    }
    Ok(())
}

fn handle_result_event(event: &StreamEvent, result: &mut StreamResult) {
    if let Some(payload) = &event.result {
        if let Ok(payload) = serde_json::from_value::<ResultPayload>(payload.clone()) {
            result.cost_usd = payload.cost_usd;
            result.session_id = payload.session_id;
            result.permission_denials = payload
                .permission_denials
                .into_iter()
                .map(|entry| PermissionDenial {
                    tool: entry.tool_name,
                    input: entry.input,
                })
                .collect();
            return;
        }
    }

    // Older CLI builds put these at the top level.
    if event.cost_usd > 0.0 {
        result.cost_usd = event.cost_usd;
    }
    if !event.session_id.is_empty() {
        result.session_id = event.session_id.clone();
    }
}

/// One-line summary of a finalized tool input: the tool's most informative
/// field, or the first string value for tools without a known one.
fn tool_summary(name: &str, raw: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return raw.trim().to_string();
    };
    let field = match name {
        "Bash" => "command",
        "Read" | "Write" | "Edit" => "file_path",
        "Grep" | "Glob" => "pattern",
        "Task" => "description",
        _ => return first_string_value(&value),
    };
    match value.get(field).and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => first_string_value(&value),
    }
}

fn first_string_value(value: &Value) -> String {
    let Some(object) = value.as_object() else {
        return String::new();
    };
    object
        .values()
        .find_map(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scan(input: &str) -> (StreamResult, String, String) {
        let mut display = Vec::new();
        let mut log = Vec::new();
        let result = process_stream(
            &CancelToken::new(),
            Cursor::new(input.as_bytes().to_vec()),
            &mut display,
            &mut log,
        )
        .expect("process stream");
        (
            result,
            String::from_utf8_lossy(&display).into_owned(),
            String::from_utf8_lossy(&log).into_owned(),
        )
    }

    fn text_delta(text: &str) -> String {
        format!(
            r#"{{"type":"stream_event","event":{{"type":"content_block_delta","delta":{{"type":"text_delta","text":"{text}"}}}}}}"#
        )
    }

    #[test]
    fn text_deltas_accumulate_and_stream() {
        let input = format!("{}\n{}\n", text_delta("Hello, "), text_delta("world"));
        let (result, display, log) = scan(&input);

        assert_eq!(result.text, "Hello, world");
        assert_eq!(display, "Hello, world");
        assert_eq!(log, "Hello, world");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let input = format!(
            "this is not json\n{}\n{{\"broken\": \n",
            text_delta("still works")
        );
        let (result, _, _) = scan(&input);
        assert_eq!(result.text, "still works");
    }

    #[test]
    fn tool_invocation_is_assembled_from_deltas() {
        let input = concat!(
            r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"tool_use","name":"Bash"}}}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"\"cargo test\"}"}}}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_stop"}}"#,
            "\n",
        );
        let (_, display, _) = scan(input);
        assert!(display.contains("Bash"));
        assert!(display.contains("cargo test"));
    }

    #[test]
    fn result_event_yields_cost_session_and_denials() {
        let input = concat!(
            r#"{"type":"result","result":{"cost_usd":0.42,"session_id":"sess-1","permission_denials":[{"tool_name":"Bash","input":"rm -rf /"}]}}"#,
            "\n",
        );
        let (result, _, _) = scan(input);
        assert_eq!(result.cost_usd, 0.42);
        assert_eq!(result.session_id, "sess-1");
        assert_eq!(
            result.permission_denials,
            vec![PermissionDenial {
                tool: "Bash".to_string(),
                input: "rm -rf /".to_string(),
            }]
        );
    }

    #[test]
    fn result_event_falls_back_to_top_level_fields() {
        let input = r#"{"type":"result","cost_usd":0.1,"session_id":"top-level"}
"#;
        let (result, _, _) = scan(input);
        assert_eq!(result.cost_usd, 0.1);
        assert_eq!(result.session_id, "top-level");
    }

    #[test]
    fn user_error_events_do_not_abort_the_scan() {
        let input = format!(
            "{}\n{}\n",
            r#"{"type":"user","is_error":true}"#,
            text_delta("after error")
        );
        let (result, _, _) = scan(&input);
        assert_eq!(result.text, "after error");
    }

    #[test]
    fn long_lines_are_handled() {
        let big = "x".repeat(1_200_000);
        let input = format!("{}\n{}\n", text_delta(&big), text_delta("tail"));
        let (result, _, _) = scan(&input);
        assert!(result.text.ends_with("tail"));
        assert_eq!(result.text.len(), big.len() + 4);
    }

    #[test]
    fn cancellation_returns_partial_result() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut display = Vec::new();
        let mut log = Vec::new();
        let result = process_stream(
            &cancel,
            Cursor::new(text_delta("never read").into_bytes()),
            &mut display,
            &mut log,
        )
        .expect("process stream");
        assert_eq!(result.text, "");
    }

    #[test]
    fn summary_extraction_per_tool() {
        assert_eq!(
            tool_summary("Read", r#"{"file_path":"src/main.rs"}"#),
            "src/main.rs"
        );
        assert_eq!(tool_summary("Grep", r#"{"pattern":"TODO"}"#), "TODO");
        assert_eq!(
            tool_summary("Task", r#"{"description":"review the diff"}"#),
            "review the diff"
        );
        // Unknown tool: first string value wins.
        assert_eq!(
            tool_summary("WebFetch", r#"{"url":"https://example.com"}"#),
            "https://example.com"
        );
        // Unparsable input falls back to the raw accumulated text.
        assert_eq!(tool_summary("Bash", "{not json"), "{not json");
    }

    #[test]
    fn denial_display_includes_input_when_present() {
        let with_input = PermissionDenial {
            tool: "Bash".to_string(),
            input: "ls".to_string(),
        };
        assert_eq!(with_input.to_string(), "Bash(ls)");

        let bare = PermissionDenial {
            tool: "Write".to_string(),
            input: String::new(),
        };
        assert_eq!(bare.to_string(), "Write");
    }
}
