//! Extractor
//!
//! Rule-based classification of parsed turns into typed, deduplicated
//! memory records. Six rules, applied in a fixed order; each produced
//! memory carries a base score, normalized keywords, and a
//! content-fingerprint `source_hash` used by the store for dedup.
//!
//! Pattern sets are compiled once into lazy statics — `regex::Regex::new`
//! is not cheap and every hook invocation is a short-lived process that
//! otherwise re-pays that cost per call.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::model::{Category, NewMemory};
use crate::parser::Turn;
use crate::scoring::{extract_keywords, score_memory};

const MAX_DECISIONS_PER_MESSAGE: usize = 3;
const MAX_ARCHITECTURE_PER_THINKING: usize = 2;
const USER_REQUEST_NOTE_SCORE: f64 = 0.35;
const COMMAND_TRUNCATE_CHARS: usize = 200;
const ERROR_TRUNCATE_CHARS: usize = 300;

static NOTABLE_COMMAND_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bnpm (install|uninstall|init|run|test)\b",
        r"\bpip (install|uninstall)\b",
        r"\bgit (init|clone|checkout|merge|rebase|tag)\b",
        r"\bdocker (build|run|compose|push|pull)\b",
        r"\bcargo\b",
        r"\bmake\b",
        r"\b(psql|mysql|sqlite3|redis-cli|mongosh)\b",
        r"\bcurl -X (POST|PUT|DELETE|PATCH)\b",
        r"\bmkdir -p\b",
        r"\b(chmod|chown)\b",
        r"\b(systemctl|service)\b",
        r"\bssh \b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern compiles"))
    .collect()
});

static DECISION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(i'll|i will|let's|let me|we should|we'll|the approach|instead of|rather than|decided to|choosing|going with|opted for)\b",
    )
    .expect("static pattern compiles")
});

static DECISION_SUPPRESS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(i'll read|i'll check|let me read|let me look|let me search|let me check)\b")
        .expect("static pattern compiles")
});

static ARCHITECTURE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(architecture|design pattern|module|component|interface|abstraction|separation of concerns|dependency|coupling|cohesion|trade-?off|approach|strategy|layer)\b",
    )
    .expect("static pattern compiles")
});

fn sha256_prefix16(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

fn build_memory(
    config: &Config,
    project: &str,
    session_id: &str,
    category: Category,
    content: String,
    source_text: &str,
    override_score: Option<f64>,
    metadata: Option<serde_json::Value>,
) -> NewMemory {
    let score = override_score.unwrap_or_else(|| score_memory(config, category, &content));
    let keywords = extract_keywords(source_text, config);
    let source_hash = Some(sha256_prefix16(source_text));
    NewMemory {
        project: project.to_string(),
        session_id: session_id.to_string(),
        category,
        content,
        keywords,
        score,
        source_hash,
        metadata,
    }
    .truncate_content()
}

/// Extract memories from every turn in order, applying all six rules per
/// turn. `project`/`session_id` tag every produced memory.
pub fn extract_memories(
    turns: &[Turn],
    project: &str,
    session_id: &str,
    config: &Config,
) -> Vec<NewMemory> {
    let mut memories = Vec::new();

    for turn in turns {
        extract_file_changes(turn, project, session_id, config, &mut memories);
        extract_notable_commands(turn, project, session_id, config, &mut memories);
        extract_errors(turn, project, session_id, config, &mut memories);
        for assistant in &turn.assistant_messages {
            extract_decisions(assistant, project, session_id, config, &mut memories);
            extract_architecture(assistant, project, session_id, config, &mut memories);
        }
        extract_user_request(turn, project, session_id, config, &mut memories);
    }

    memories
}

/// Rule 1: file changes via Write/Edit/MultiEdit tool calls.
fn extract_file_changes(
    turn: &Turn,
    project: &str,
    session_id: &str,
    config: &Config,
    out: &mut Vec<NewMemory>,
) {
    for call in &turn.tool_calls {
        if !matches!(call.name.as_str(), "Write" | "Edit" | "MultiEdit") {
            continue;
        }
        let path = call
            .input
            .get("file_path")
            .or_else(|| call.input.get("path"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if path.is_empty() {
            continue;
        }

        let content = if call.name == "Write" {
            format!("Created/wrote file: {path}")
        } else {
            let old = call.input.get("old_string").and_then(|v| v.as_str());
            let new = call.input.get("new_string").and_then(|v| v.as_str());
            match (old, new) {
                (Some(old), Some(new)) => format!(
                    "Edited file: {path}\n  Changed: \"{}\" → \"{}\"",
                    truncate_display(old, 80),
                    truncate_display(new, 80)
                ),
                _ => format!("Edited file: {path}"),
            }
        };

        let source_text = format!("{}{path}", call.name);
        out.push(build_memory(
            config,
            project,
            session_id,
            Category::FileChange,
            content,
            &source_text,
            None,
            None,
        ));
    }
}

fn truncate_display(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect::<String>() + "…"
    }
}

/// Rule 2: notable package-manager / deploy / infra commands.
fn extract_notable_commands(
    turn: &Turn,
    project: &str,
    session_id: &str,
    config: &Config,
    out: &mut Vec<NewMemory>,
) {
    for call in &turn.tool_calls {
        if call.name != "Bash" {
            continue;
        }
        let Some(cmd) = call.input.get("command").and_then(|v| v.as_str()) else {
            continue;
        };
        if NOTABLE_COMMAND_PATTERNS.iter().any(|p| p.is_match(cmd)) {
            let truncated = crate::model::truncate_utf8(cmd, COMMAND_TRUNCATE_CHARS);
            let content = format!("Ran command: {truncated}");
            out.push(build_memory(
                config,
                project,
                session_id,
                Category::Note,
                content,
                cmd,
                None,
                None,
            ));
        }
    }
}

/// Rule 3: errored tool results.
fn extract_errors(
    turn: &Turn,
    project: &str,
    session_id: &str,
    config: &Config,
    out: &mut Vec<NewMemory>,
) {
    for result in &turn.tool_results {
        if !result.is_error || result.content.trim().is_empty() {
            continue;
        }
        let truncated = crate::model::truncate_utf8(&result.content, ERROR_TRUNCATE_CHARS);
        let content = format!("Error encountered: {truncated}");
        out.push(build_memory(
            config,
            project,
            session_id,
            Category::Error,
            content,
            &result.content,
            None,
            None,
        ));
    }
}

/// Rule 4: decision phrasing in assistant text, max 3 per message.
fn extract_decisions(
    assistant: &crate::parser::Message,
    project: &str,
    session_id: &str,
    config: &Config,
    out: &mut Vec<NewMemory>,
) {
    let mut emitted = 0;
    for line in assistant.text.lines() {
        if emitted >= MAX_DECISIONS_PER_MESSAGE {
            break;
        }
        let trimmed = line.trim();
        let len = trimmed.chars().count();
        if !(20..=300).contains(&len) {
            continue;
        }
        if DECISION_SUPPRESS_PATTERN.is_match(trimmed) {
            continue;
        }
        if DECISION_PATTERN.is_match(trimmed) {
            out.push(build_memory(
                config,
                project,
                session_id,
                Category::Decision,
                trimmed.to_string(),
                trimmed,
                None,
                None,
            ));
            emitted += 1;
        }
    }
}

/// Rule 5: architecture vocabulary in assistant thinking, max 2 per block.
fn extract_architecture(
    assistant: &crate::parser::Message,
    project: &str,
    session_id: &str,
    config: &Config,
    out: &mut Vec<NewMemory>,
) {
    let mut emitted = 0;
    for line in assistant.thinking.lines() {
        if emitted >= MAX_ARCHITECTURE_PER_THINKING {
            break;
        }
        let trimmed = line.trim();
        let len = trimmed.chars().count();
        if !(30..=400).contains(&len) {
            continue;
        }
        if ARCHITECTURE_PATTERN.is_match(trimmed) {
            out.push(build_memory(
                config,
                project,
                session_id,
                Category::Architecture,
                trimmed.to_string(),
                trimmed,
                None,
                None,
            ));
            emitted += 1;
        }
    }
}

/// Rule 6: a substantial user request, recorded as a note with an override
/// score of 0.35. Boundary is strict: length `> 20` and `<= 500`.
fn extract_user_request(
    turn: &Turn,
    project: &str,
    session_id: &str,
    config: &Config,
    out: &mut Vec<NewMemory>,
) {
    let Some(user_message) = &turn.user_message else {
        return;
    };
    let len = user_message.text.chars().count();
    if len > 20 && len <= 500 {
        let content = format!("User request: {}", user_message.text.trim());
        out.push(build_memory(
            config,
            project,
            session_id,
            Category::Note,
            content,
            &user_message.text,
            Some(USER_REQUEST_NOTE_SCORE),
            None,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Message, ToolCall, ToolResult};
    use serde_json::json;

    fn turn_with_tool_call(name: &str, input: serde_json::Value) -> Turn {
        Turn {
            tool_calls: vec![ToolCall {
                name: name.to_string(),
                id: "t1".to_string(),
                input,
            }],
            start_line: 1,
            end_line: 1,
            ..Default::default()
        }
    }

    #[test]
    fn file_write_produces_file_change() {
        let config = Config::default();
        let turn = turn_with_tool_call("Write", json!({"file_path": "/src/lib.rs"}));
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].category, Category::FileChange);
        assert!(memories[0].content.starts_with("Created/wrote file: /src/lib.rs"));
    }

    #[test]
    fn edit_with_old_new_string_includes_diff_preview() {
        let config = Config::default();
        let turn = turn_with_tool_call(
            "Edit",
            json!({"file_path": "/src/lib.rs", "old_string": "foo", "new_string": "bar"}),
        );
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        assert!(memories[0].content.contains("Changed: \"foo\" → \"bar\""));
    }

    #[test]
    fn notable_command_is_captured() {
        let config = Config::default();
        let turn = turn_with_tool_call("Bash", json!({"command": "npm install express"}));
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].category, Category::Note);
        assert!(memories[0].content.starts_with("Ran command:"));
    }

    #[test]
    fn unremarkable_command_is_ignored() {
        let config = Config::default();
        let turn = turn_with_tool_call("Bash", json!({"command": "ls -la"}));
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        assert!(memories.is_empty());
    }

    #[test]
    fn error_capture_matches_scenario_2() {
        let config = Config::default();
        let turn = Turn {
            tool_calls: vec![ToolCall {
                name: "Bash".to_string(),
                id: "t1".to_string(),
                input: json!({"command": "npm test"}),
            }],
            tool_results: vec![ToolResult {
                tool_use_id: "t1".to_string(),
                content: "Error: test failed".to_string(),
                is_error: true,
            }],
            ..Default::default()
        };
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        let error_mem = memories.iter().find(|m| m.category == Category::Error).unwrap();
        assert!(error_mem.content.starts_with("Error encountered:"));
        assert!(error_mem.content.contains("test failed"));
    }

    #[test]
    fn decision_phrasing_is_captured_and_capped_at_three() {
        let config = Config::default();
        let assistant = Message {
            role: "assistant".to_string(),
            text: (0..5)
                .map(|i| format!("Let's use approach number {i} for this particular problem here"))
                .collect::<Vec<_>>()
                .join("\n"),
            thinking: String::new(),
            tool_calls: vec![],
            tool_results: vec![],
        };
        let turn = Turn {
            assistant_messages: vec![assistant],
            ..Default::default()
        };
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        assert_eq!(memories.iter().filter(|m| m.category == Category::Decision).count(), 3);
    }

    #[test]
    fn pure_intent_suppressed() {
        let config = Config::default();
        let assistant = Message {
            role: "assistant".to_string(),
            text: "Let me check the existing test suite before making changes".to_string(),
            thinking: String::new(),
            tool_calls: vec![],
            tool_results: vec![],
        };
        let turn = Turn {
            assistant_messages: vec![assistant],
            ..Default::default()
        };
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        assert!(memories.iter().all(|m| m.category != Category::Decision));
    }

    #[test]
    fn architecture_vocabulary_in_thinking_is_captured() {
        let config = Config::default();
        let assistant = Message {
            role: "assistant".to_string(),
            text: String::new(),
            thinking: "This module's separation of concerns keeps the storage layer decoupled from scoring"
                .to_string(),
            tool_calls: vec![],
            tool_results: vec![],
        };
        let turn = Turn {
            assistant_messages: vec![assistant],
            ..Default::default()
        };
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        assert!(memories.iter().any(|m| m.category == Category::Architecture));
    }

    #[test]
    fn user_request_boundary_lengths() {
        let config = Config::default();
        for (len, expect_note) in [(20, false), (21, true), (500, true), (501, false)] {
            let text = "x".repeat(len);
            let turn = Turn {
                user_message: Some(Message {
                    role: "user".to_string(),
                    text,
                    thinking: String::new(),
                    tool_calls: vec![],
                    tool_results: vec![],
                }),
                ..Default::default()
            };
            let memories = extract_memories(&[turn], "proj", "sess", &config);
            let has_note = memories
                .iter()
                .any(|m| m.category == Category::Note && m.content.starts_with("User request:"));
            assert_eq!(has_note, expect_note, "length {len}");
        }
    }

    #[test]
    fn source_hash_is_sixteen_hex_chars() {
        let config = Config::default();
        let turn = turn_with_tool_call("Write", json!({"file_path": "/a.rs"}));
        let memories = extract_memories(&[turn], "proj", "sess", &config);
        let hash = memories[0].source_hash.as_ref().unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
