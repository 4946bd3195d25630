//! The agent CLI's stream-json protocol, as seen by a supervising process.
//!
//! Inbound (agent stdout), one JSON object per line:
//! - `system` / `init` carries the real session id
//! - `assistant` messages carry text and tool use
//! - `result` ends a turn; the session is idle until the next user message
//! - `control_request` / `can_use_tool` asks permission to run a tool;
//!   the `AskUserQuestion` tool is a question for the human instead
//!
//! Outbound (agent stdin) are `user` messages and `control_response`s.

use serde::Deserialize;
use serde_json::{Value, json};

/// Tool name the agent uses to ask the human a question.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// Arguments for running the agent CLI as a supervised, streaming session.
pub const SESSION_ARGS: &[&str] = &[
    "--output-format",
    "stream-json",
    "--input-format",
    "stream-json",
    "--verbose",
    "--permission-prompt-tool",
    "stdio",
];

/// Raw stream-json line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    Text {
        text: String,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(other)]
    Other,
}

/// What a stdout line means to the session supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Handshake finished; the agent revealed its session id.
    Init { session_id: String },
    /// The agent did something; `summary` is a one-line description.
    Activity { summary: String },
    /// The turn is over and the session is idle.
    TurnComplete {
        is_error: bool,
        result: Option<String>,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: Value,
    },
    Question { request_id: String, input: Value },
    /// Lines the supervisor does not act on.
    Ignored,
}

/// Parse one stdout line.
pub fn parse_line(line: &str) -> Result<SessionSignal, serde_json::Error> {
    let event: StreamEvent = serde_json::from_str(line)?;
    Ok(match event {
        StreamEvent::System {
            subtype,
            session_id: Some(session_id),
        } if subtype == "init" => SessionSignal::Init { session_id },
        StreamEvent::System { .. } | StreamEvent::Other => SessionSignal::Ignored,
        StreamEvent::Assistant { message, .. } => {
            let summary = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, input, .. } => Some(describe_tool_use(name, input)),
                    ContentBlock::Text { text } => Some(truncate_str(first_line(text), 80)),
                    ContentBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            SessionSignal::Activity { summary }
        }
        StreamEvent::Result {
            result, is_error, ..
        } => SessionSignal::TurnComplete { is_error, result },
        StreamEvent::ControlRequest {
            request_id,
            request: ControlRequest::CanUseTool { tool_name, input },
        } => {
            if tool_name == ASK_USER_QUESTION_TOOL {
                SessionSignal::Question { request_id, input }
            } else {
                SessionSignal::PermissionRequest {
                    request_id,
                    tool_name,
                    input,
                }
            }
        }
        StreamEvent::ControlRequest { .. } => SessionSignal::Ignored,
    })
}

/// A user turn, as written to the agent's stdin.
pub fn user_message(text: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
    .to_string()
}

/// Allow a tool call, optionally with rewritten input.
pub fn allow_response(request_id: &str, updated_input: &Value) -> String {
    control_response(
        request_id,
        json!({ "behavior": "allow", "updatedInput": updated_input }),
    )
}

pub fn deny_response(request_id: &str, reason: &str) -> String {
    control_response(request_id, json!({ "behavior": "deny", "message": reason }))
}

fn control_response(request_id: &str, response: Value) -> String {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    })
    .to_string()
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" | "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Searching: {}", pattern)
        }
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text).trim()
}

/// Truncate a string with ellipsis, on a char boundary
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_reveals_session_id() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-42","tools":[]}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            SessionSignal::Init {
                session_id: "sess-42".into()
            }
        );
    }

    #[test]
    fn test_parse_assistant_tool_use() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/foo/src/bar.rs"},"id":"123"},{"type":"text","text":"Looking\nmore"}]},"session_id":"abc"}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            SessionSignal::Activity {
                summary: "Reading: src/bar.rs; Looking".into()
            }
        );
    }

    #[test]
    fn test_parse_result_ends_turn() {
        let line = r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            SessionSignal::TurnComplete {
                is_error: false,
                result: Some("done".into())
            }
        );
    }

    #[test]
    fn test_parse_permission_and_question_requests() {
        let line = r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf target"}}}"#;
        match parse_line(line).unwrap() {
            SessionSignal::PermissionRequest {
                request_id,
                tool_name,
                input,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(tool_name, "Bash");
                assert_eq!(input["command"], "rm -rf target");
            }
            other => panic!("Expected PermissionRequest, got {:?}", other),
        }

        let line = r#"{"type":"control_request","request_id":"r2","request":{"subtype":"can_use_tool","tool_name":"AskUserQuestion","input":{"questions":[{"question":"Which DB?"}]}}}"#;
        assert!(matches!(
            parse_line(line).unwrap(),
            SessionSignal::Question { ref request_id, .. } if request_id == "r2"
        ));
    }

    #[test]
    fn test_unknown_lines_are_ignored() {
        assert_eq!(
            parse_line(r#"{"type":"user","message":{}}"#).unwrap(),
            SessionSignal::Ignored
        );
        assert_eq!(
            parse_line(r#"{"type":"system","subtype":"compact_boundary"}"#).unwrap(),
            SessionSignal::Ignored
        );
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn test_outbound_messages() {
        let msg: Value = serde_json::from_str(&user_message("continue")).unwrap();
        assert_eq!(msg["type"], "user");
        assert_eq!(msg["message"]["content"], "continue");

        let allow: Value =
            serde_json::from_str(&allow_response("r1", &json!({"command": "ls"}))).unwrap();
        assert_eq!(allow["response"]["request_id"], "r1");
        assert_eq!(allow["response"]["response"]["behavior"], "allow");
        assert_eq!(allow["response"]["response"]["updatedInput"]["command"], "ls");

        let deny: Value = serde_json::from_str(&deny_response("r2", "nope")).unwrap();
        assert_eq!(deny["response"]["response"]["behavior"], "deny");
        assert_eq!(deny["response"]["response"]["message"], "nope");
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(
            describe_tool_use("Bash", &input),
            "Running: cargo test --release"
        );
        assert_eq!(truncate_str("ééééééé", 5), "éé...");
    }
}
