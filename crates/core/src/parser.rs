//! Transcript parser
//!
//! Incremental JSONL reader with a resumable line-number cursor. Reads are
//! re-done from the top of the file each call and discarded up to the
//! checkpoint — see `SPEC_FULL.md`'s note on why this keeps "non-blank line
//! number" the single source of truth instead of caching a byte offset.

use std::io::BufRead;
use std::path::Path;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("failed to open transcript: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ParserError>;

/// A tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub id: String,
    pub input: Value,
}

/// A tool's result, recorded on the synthetic user message that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// One transcript entry after role derivation and content-block walking.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

impl Message {
    fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: String::new(),
            thinking: String::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    /// A synthetic tool-result message: role "user", no human text, but
    /// carrying tool results.
    pub fn is_synthetic_tool_result(&self) -> bool {
        self.role == "user" && self.text.trim().is_empty() && !self.tool_results.is_empty()
    }
}

/// A user message plus the assistant reply(ies) it elicited, augmented with
/// any tool calls/results seen inside.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    pub user_message: Option<Message>,
    pub assistant_messages: Vec<Message>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub start_line: u64,
    pub end_line: u64,
}

/// Parse `path` starting after `start_line` (lines numbered 1..), returning
/// every derived [`Message`] plus the greatest non-blank line number
/// reached. Malformed JSON lines are skipped silently; blank lines don't
/// advance the line counter.
pub fn parse_transcript(path: &Path, start_line: u64) -> Result<(Vec<Message>, u64)> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);

    let mut messages = Vec::new();
    let mut line_no: u64 = 0;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        line_no += 1;
        if line_no <= start_line {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if let Some(message) = derive_message(&value) {
            messages.push(message);
        }
    }

    Ok((messages, line_no))
}

/// Derive a [`Message`] from one parsed transcript entry, or `None` if the
/// entry's role/type isn't one that carries conversational content (filters
/// `system`, `progress`, `file-history-snapshot`, etc).
fn derive_message(value: &Value) -> Option<Message> {
    let role = derive_role(value)?;
    let mut message = Message::new(role);

    // A bare string `content` at top level is taken verbatim as text.
    if let Some(s) = value.get("content").and_then(|c| c.as_str()) {
        message.text.push_str(s);
        return Some(message);
    }

    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("content"));

    match content {
        Some(Value::String(s)) => message.text.push_str(s),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                walk_content_block(block, &mut message);
            }
        }
        _ => {}
    }

    Some(message)
}

fn derive_role(value: &Value) -> Option<String> {
    if let Some(role) = value
        .get("message")
        .and_then(|m| m.get("role"))
        .and_then(|r| r.as_str())
    {
        if role == "user" || role == "assistant" {
            return Some(role.to_string());
        }
    }

    match value.get("type").and_then(|t| t.as_str()) {
        Some("user") => Some("user".to_string()),
        Some("assistant") => Some("assistant".to_string()),
        Some("A") => Some("assistant".to_string()),
        _ => None,
    }
}

fn walk_content_block(block: &Value, message: &mut Message) {
    let Some(block_type) = block.get("type").and_then(|t| t.as_str()) else {
        return;
    };

    match block_type {
        "text" => {
            if let Some(s) = block.get("text").and_then(|t| t.as_str()) {
                message.text.push_str(s);
            }
        }
        "thinking" => {
            if let Some(s) = block.get("thinking").and_then(|t| t.as_str()) {
                message.thinking.push_str(s);
            }
        }
        "tool_use" => {
            let name = block
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let id = block
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            message.tool_calls.push(ToolCall { name, id, input });
        }
        "tool_result" => {
            let tool_use_id = block
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let is_error = block
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let content = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            message.tool_results.push(ToolResult {
                tool_use_id,
                content,
                is_error,
            });
        }
        _ => {}
    }
}

/// Group a flat message sequence into [`Turn`]s.
///
/// - A non-synthetic user message closes any open turn and opens a new one.
/// - A synthetic tool-result user message (empty text, non-empty results)
///   folds into the currently open turn instead of opening a new one.
/// - Assistant messages append to the open turn; messages before the first
///   user message are discarded.
pub fn group_into_turns(messages: &[Message]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    let mut current: Option<Turn> = None;

    for (idx, message) in messages.iter().enumerate() {
        let line = idx as u64 + 1;
        match message.role.as_str() {
            "user" if message.is_synthetic_tool_result() => {
                if let Some(turn) = current.as_mut() {
                    turn.tool_results.extend(message.tool_results.clone());
                    turn.end_line = line;
                }
                // No open turn: a synthetic message with nothing to fold
                // into is simply dropped.
            }
            "user" => {
                if let Some(turn) = current.take() {
                    turns.push(turn);
                }
                current = Some(Turn {
                    user_message: Some(message.clone()),
                    start_line: line,
                    end_line: line,
                    ..Default::default()
                });
            }
            "assistant" => {
                if let Some(turn) = current.as_mut() {
                    turn.tool_calls.extend(message.tool_calls.clone());
                    turn.tool_results.extend(message.tool_results.clone());
                    turn.assistant_messages.push(message.clone());
                    turn.end_line = line;
                }
                // Assistant messages before any user message are discarded.
            }
            _ => {}
        }
    }

    if let Some(turn) = current.take() {
        turns.push(turn);
    }

    turns
}
