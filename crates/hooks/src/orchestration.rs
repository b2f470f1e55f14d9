//! Lifecycle orchestration
//!
//! Six pipelines, one per hook event, each wiring config, parsing, extraction,
//! storage, and restoration together and producing the
//! [`crate::runtime::HookOutput`] the runtime writes to stdout. Every
//! function is infallible from its caller's point of view: internal errors
//! are logged and folded into an empty/`None` result rather than
//! propagated. A hook body never fails the host.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use infinite_context_core::config::{get_project_config, Config};
use infinite_context_core::extractor::extract_memories;
use infinite_context_core::model::NewMemory;
use infinite_context_core::parser::{group_into_turns, parse_transcript};
use infinite_context_core::restorer::{recall_for_prompt, restore_context};
use infinite_context_core::scoring::{estimate_tokens, extract_keywords};
use infinite_context_core::store::Storage;

use crate::runtime::HookOutput;

const RECALL_RATE_LIMIT_SECONDS: i64 = 60;
const MIN_PROMPT_LEN: usize = 10;
const RECALL_TOKEN_CEILING: usize = 600;
const RECALL_TOKEN_TARGET: usize = 500;

static FILE_PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:Created/wrote file|Edited file): (\S+)").expect("static pattern compiles"));

fn get_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(|v| v.as_str())
}

fn hook_context_json(event: &str, text: &str) -> HookOutput {
    if text.is_empty() {
        return HookOutput::None;
    }
    HookOutput::Json(json!({
        "hookSpecificOutput": {
            "hookEventName": event,
            "additionalContext": text,
        }
    }))
}

/// Re-parse from the checkpoint, recovering from a rollback (the host
/// rewrote the transcript shorter than the saved checkpoint) by re-parsing
/// from line 0. Returns the grouped turns and the new checkpoint line.
fn parse_with_rollback_recovery(
    transcript_path: &Path,
    checkpoint_line: u64,
) -> (Vec<infinite_context_core::parser::Turn>, u64) {
    let (messages, last_line) = match parse_transcript(transcript_path, checkpoint_line) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("[infinite-context] failed to parse transcript: {e}");
            return (Vec::new(), checkpoint_line);
        }
    };

    if last_line < checkpoint_line {
        tracing::warn!(
            "[infinite-context] rollback detected (lastLine {last_line} < checkpoint {checkpoint_line}), re-parsing from 0"
        );
        return match parse_transcript(transcript_path, 0) {
            Ok((messages, last_line)) => (group_into_turns(&messages), last_line),
            Err(e) => {
                tracing::warn!("[infinite-context] failed to re-parse transcript from 0: {e}");
                (Vec::new(), checkpoint_line)
            }
        };
    }

    (group_into_turns(&messages), last_line)
}

/// Build the `PreCompact` plain-text summary: archived count, top decisions,
/// files changed, top errors. Paths are pulled from category content via
/// [`FILE_PATH_PATTERN`]'s capture group, never naive colon splitting.
fn render_compaction_summary(project: &str, memories: &[NewMemory]) -> String {
    use infinite_context_core::model::Category;

    let mut lines = vec![
        "CONTEXT ARCHIVE (from infinite-context):".to_string(),
        format!("Project: {project}"),
        format!("Archived {} memories.", memories.len()),
    ];

    let decisions: Vec<&NewMemory> = memories.iter().filter(|m| m.category == Category::Decision).collect();
    if !decisions.is_empty() {
        lines.push(String::new());
        lines.push("Top decisions:".to_string());
        for m in decisions.iter().take(5) {
            lines.push(format!("- {}", m.content));
        }
    }

    let files: Vec<String> = memories
        .iter()
        .filter(|m| m.category == Category::FileChange)
        .filter_map(|m| FILE_PATH_PATTERN.captures(&m.content))
        .map(|c| c[1].to_string())
        .collect();
    if !files.is_empty() {
        lines.push(String::new());
        lines.push("Files changed:".to_string());
        for path in files.iter().take(10) {
            lines.push(format!("- {path}"));
        }
    }

    let errors: Vec<&NewMemory> = memories.iter().filter(|m| m.category == Category::Error).collect();
    if !errors.is_empty() {
        lines.push(String::new());
        lines.push("Top errors:".to_string());
        for m in errors.iter().take(5) {
            lines.push(format!("- {}", m.content));
        }
    }

    let mut text = lines.join("\n");
    if text.len() > 2000 {
        text = infinite_context_core::model::truncate_utf8(&text, 2000);
    }
    text
}

/// Truncate `text` to roughly `target` tokens by dropping trailing lines,
/// only when it exceeds `ceiling` tokens in the first place.
fn truncate_to_token_budget(text: &str, ceiling: usize, target: usize) -> String {
    if estimate_tokens(text) <= ceiling {
        return text.to_string();
    }
    let mut out = String::new();
    for line in text.lines() {
        let candidate = if out.is_empty() {
            line.to_string()
        } else {
            format!("{out}\n{line}")
        };
        if estimate_tokens(&candidate) > target {
            break;
        }
        out = candidate;
    }
    out
}

pub async fn pre_compact(storage: &Storage, input: Value) -> HookOutput {
    let (Some(session_id), Some(transcript_path), Some(cwd)) = (
        get_str(&input, "session_id"),
        get_str(&input, "transcript_path"),
        get_str(&input, "cwd"),
    ) else {
        return HookOutput::None;
    };
    let project = cwd;
    let config = get_project_config(project);

    if let Err(e) = storage.upsert_session(session_id, project) {
        tracing::error!("[infinite-context] upsert_session failed: {e}");
        return HookOutput::None;
    }

    let checkpoint_line = match storage.get_checkpoint(session_id, transcript_path) {
        Ok(cp) => cp.map(|c| c.last_line_number).unwrap_or(0),
        Err(e) => {
            tracing::error!("[infinite-context] get_checkpoint failed: {e}");
            0
        }
    };

    let (turns, new_line) = parse_with_rollback_recovery(Path::new(transcript_path), checkpoint_line);
    let memories = extract_memories(&turns, project, session_id, &config);

    let inserted = match storage.insert_many(&memories) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("[infinite-context] insert_many failed: {e}");
            0
        }
    };

    if let Err(e) = storage.save_checkpoint(session_id, transcript_path, new_line) {
        tracing::error!("[infinite-context] save_checkpoint failed: {e}");
    }
    if let Err(e) = storage.incr_session_memories(session_id, inserted as i64) {
        tracing::error!("[infinite-context] incr_session_memories failed: {e}");
    }
    if let Err(e) = storage.incr_session_compactions(session_id) {
        tracing::error!("[infinite-context] incr_session_compactions failed: {e}");
    }
    if let Err(e) = storage.enforce_project_limit(project, &config) {
        tracing::error!("[infinite-context] enforce_project_limit failed: {e}");
    }

    HookOutput::Text(render_compaction_summary(project, &memories))
}

pub async fn session_start(storage: &Storage, input: Value) -> HookOutput {
    let (Some(session_id), Some(cwd), Some(source)) = (
        get_str(&input, "session_id"),
        get_str(&input, "cwd"),
        get_str(&input, "source"),
    ) else {
        return HookOutput::None;
    };
    if !matches!(source, "compact" | "clear" | "resume" | "startup") {
        return HookOutput::None;
    }
    let project = cwd;
    let config = get_project_config(project);

    if let Err(e) = storage.upsert_session(session_id, project) {
        tracing::error!("[infinite-context] upsert_session failed: {e}");
        return HookOutput::None;
    }

    let budget = if source == "compact" {
        config.max_restore_tokens.min(2000)
    } else {
        config.max_restore_tokens
    };

    let top = match storage.get_top_memories(project, Some(config.max_memories_per_restore), &config) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("[infinite-context] get_top_memories failed: {e}");
            return HookOutput::None;
        }
    };

    let result = restore_context(&top, Some(budget), &config, Utc::now());
    if let Err(e) = storage.touch_memories(&result.ids) {
        tracing::error!("[infinite-context] touch_memories failed: {e}");
    }

    hook_context_json("SessionStart", &result.text)
}

/// Prompts too short or visibly system-generated (e.g. wrapped in a
/// `<tag>`) aren't worth a recall round-trip.
fn is_low_value_prompt(prompt: &str) -> bool {
    let trimmed = prompt.trim();
    trimmed.chars().count() < MIN_PROMPT_LEN || trimmed.starts_with('<')
}

fn rate_limit_path(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join("prompt-state.json")
}

fn load_rate_limit_state(path: &Path) -> HashMap<String, i64> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn save_rate_limit_state(path: &Path, state: &HashMap<String, i64>) {
    if let Ok(json) = serde_json::to_string(state) {
        if let Err(e) = std::fs::write(path, json) {
            tracing::warn!("[infinite-context] failed to persist prompt-state.json: {e}");
        }
    }
}

pub async fn user_prompt_submit(storage: &Storage, input: Value) -> HookOutput {
    let (Some(cwd), Some(prompt)) = (get_str(&input, "cwd"), get_str(&input, "prompt")) else {
        return HookOutput::None;
    };
    if is_low_value_prompt(prompt) {
        return HookOutput::None;
    }
    let project = cwd;
    let config = get_project_config(project);

    let state_path = rate_limit_path(&infinite_context_core::config::data_dir());
    let mut state = load_rate_limit_state(&state_path);
    let now_ms = Utc::now().timestamp_millis();
    if let Some(&last) = state.get(project) {
        if now_ms - last < RECALL_RATE_LIMIT_SECONDS * 1000 {
            return HookOutput::None;
        }
    }
    state.insert(project.to_string(), now_ms);
    save_rate_limit_state(&state_path, &state);

    let keywords = extract_keywords(prompt, &config);
    let results = match storage.search(&keywords, Some(project), config.max_prompt_recall_results) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[infinite-context] search failed: {e}");
            return HookOutput::None;
        }
    };

    let recall = recall_for_prompt(&results);
    let text = truncate_to_token_budget(&recall.text, RECALL_TOKEN_CEILING, RECALL_TOKEN_TARGET);

    if let Err(e) = storage.touch_memories(&recall.ids) {
        tracing::error!("[infinite-context] touch_memories failed: {e}");
    }

    hook_context_json("UserPromptSubmit", &text)
}

pub async fn subagent_start(storage: &Storage, input: Value) -> HookOutput {
    let (Some(cwd), Some(_agent_id), Some(_agent_type)) = (
        get_str(&input, "cwd"),
        get_str(&input, "agent_id"),
        get_str(&input, "agent_type"),
    ) else {
        return HookOutput::None;
    };
    let project = cwd;
    let config = get_project_config(project);

    let budget = (config.max_restore_tokens as f64 * 0.6).floor() as u32;
    let limit = (config.max_memories_per_restore as f64 * 0.6).floor() as u32;

    let top = match storage.get_top_memories(project, Some(limit), &config) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("[infinite-context] get_top_memories failed: {e}");
            return HookOutput::None;
        }
    };

    let result = restore_context(&top, Some(budget), &config, Utc::now());
    if let Err(e) = storage.touch_memories(&result.ids) {
        tracing::error!("[infinite-context] touch_memories failed: {e}");
    }

    hook_context_json("SubagentStart", &result.text)
}

pub async fn subagent_stop(storage: &Storage, input: Value) -> HookOutput {
    let (Some(session_id), Some(cwd), Some(agent_id), Some(agent_type), Some(agent_transcript_path)) = (
        get_str(&input, "session_id"),
        get_str(&input, "cwd"),
        get_str(&input, "agent_id"),
        get_str(&input, "agent_type"),
        get_str(&input, "agent_transcript_path"),
    ) else {
        return HookOutput::None;
    };
    let project = cwd;
    let config = get_project_config(project);
    let checkpoint_key = format!("{session_id}:{agent_id}");

    if let Err(e) = storage.upsert_session(session_id, project) {
        tracing::error!("[infinite-context] upsert_session failed: {e}");
        return HookOutput::None;
    }

    let checkpoint_line = match storage.get_checkpoint(&checkpoint_key, agent_transcript_path) {
        Ok(cp) => cp.map(|c| c.last_line_number).unwrap_or(0),
        Err(e) => {
            tracing::error!("[infinite-context] get_checkpoint failed: {e}");
            0
        }
    };

    let (turns, new_line) =
        parse_with_rollback_recovery(Path::new(agent_transcript_path), checkpoint_line);
    let mut memories = extract_memories(&turns, project, session_id, &config);

    for m in memories.iter_mut() {
        let mut map = m
            .metadata
            .as_ref()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        map.insert("agentId".to_string(), json!(agent_id));
        map.insert("agentType".to_string(), json!(agent_type));
        m.metadata = Some(Value::Object(map));
    }

    let inserted = match storage.insert_many(&memories) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("[infinite-context] insert_many failed: {e}");
            0
        }
    };

    if let Err(e) = storage.save_checkpoint(&checkpoint_key, agent_transcript_path, new_line) {
        tracing::error!("[infinite-context] save_checkpoint failed: {e}");
    }
    if let Err(e) = storage.incr_session_memories(session_id, inserted as i64) {
        tracing::error!("[infinite-context] incr_session_memories failed: {e}");
    }

    HookOutput::None
}

pub async fn session_end(storage: &Storage, input: Value) -> HookOutput {
    let (Some(session_id), Some(cwd)) = (get_str(&input, "session_id"), get_str(&input, "cwd")) else {
        return HookOutput::None;
    };
    let project = cwd;
    let config: Config = get_project_config(project);

    if let Some(transcript_path) = get_str(&input, "transcript_path") {
        let checkpoint_line = match storage.get_checkpoint(session_id, transcript_path) {
            Ok(cp) => cp.map(|c| c.last_line_number).unwrap_or(0),
            Err(e) => {
                tracing::error!("[infinite-context] get_checkpoint failed: {e}");
                0
            }
        };
        let (turns, new_line) =
            parse_with_rollback_recovery(Path::new(transcript_path), checkpoint_line);
        let memories = extract_memories(&turns, project, session_id, &config);
        let inserted = match storage.insert_many(&memories) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("[infinite-context] insert_many failed: {e}");
                0
            }
        };
        if let Err(e) = storage.save_checkpoint(session_id, transcript_path, new_line) {
            tracing::error!("[infinite-context] save_checkpoint failed: {e}");
        }
        if let Err(e) = storage.incr_session_memories(session_id, inserted as i64) {
            tracing::error!("[infinite-context] incr_session_memories failed: {e}");
        }
    }

    if let Err(e) = storage.decay_and_prune(&config) {
        tracing::error!("[infinite-context] decay_and_prune failed: {e}");
    }
    if let Err(e) = storage.enforce_project_limit(project, &config) {
        tracing::error!("[infinite-context] enforce_project_limit failed: {e}");
    }
    if let Err(e) = storage.end_session(session_id) {
        tracing::error!("[infinite-context] end_session failed: {e}");
    }

    HookOutput::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use infinite_context_core::config::Config;
    use infinite_context_core::store::Storage;
    use std::io::Write as _;

    fn write_transcript(path: &Path, lines: &[&str]) {
        let mut file = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    const USER_HI: &str = r#"{"type":"user","message":{"role":"user","content":"hi"}}"#;
    const ASSISTANT_WRITE: &str = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Write","input":{"file_path":"/src/a.rs"}}]}}"#;

    #[tokio::test]
    async fn pre_compact_then_rollback_dedups_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("memory.db")).unwrap();
        let transcript_path = dir.path().join("transcript.jsonl");
        write_transcript(&transcript_path, &[USER_HI, ASSISTANT_WRITE]);
        let transcript_path_str = transcript_path.to_str().unwrap();

        let input = json!({
            "session_id": "s1",
            "transcript_path": transcript_path_str,
            "cwd": "projA",
        });

        // First run: archives one file-change memory, checkpoints at line 2.
        let out = pre_compact(&storage, input.clone()).await;
        match out {
            HookOutput::Text(t) => assert!(t.contains("Archived 1 memories.")),
            _ => panic!("expected a text summary"),
        }
        let checkpoint = storage.get_checkpoint("s1", transcript_path_str).unwrap().unwrap();
        assert_eq!(checkpoint.last_line_number, 2);

        let config = Config::default();
        let memories = storage.get_top_memories("projA", None, &config).unwrap();
        assert_eq!(memories.len(), 1);

        // Simulate a retried/duplicate invocation over the same unchanged
        // transcript: the source_hash unique index must dedup it away.
        storage.save_checkpoint("s1", transcript_path_str, 0).unwrap();
        let out = pre_compact(&storage, input.clone()).await;
        match out {
            HookOutput::Text(t) => assert!(t.contains("Archived 1 memories.")),
            _ => panic!("expected a text summary"),
        }
        let memories = storage.get_top_memories("projA", None, &config).unwrap();
        assert_eq!(memories.len(), 1, "duplicate content must not double-insert");
        let checkpoint = storage.get_checkpoint("s1", transcript_path_str).unwrap().unwrap();
        assert_eq!(checkpoint.last_line_number, 2);

        // Simulate a rollback: the host rewrites the transcript shorter than
        // the saved checkpoint. session_end must detect it and re-parse from
        // line 0 rather than silently reading nothing.
        write_transcript(&transcript_path, &[USER_HI]);
        let end_input = json!({
            "session_id": "s1",
            "cwd": "projA",
            "transcript_path": transcript_path_str,
        });
        let out = session_end(&storage, end_input).await;
        assert!(matches!(out, HookOutput::None));

        let checkpoint = storage.get_checkpoint("s1", transcript_path_str).unwrap().unwrap();
        assert_eq!(checkpoint.last_line_number, 1, "rollback must re-checkpoint from the re-parsed line count");
        let memories = storage.get_top_memories("projA", None, &config).unwrap();
        assert_eq!(memories.len(), 1, "a bare 'hi' user message produces no new memory");
    }

    #[test]
    fn low_value_prompt_detects_short_and_tagged() {
        assert!(is_low_value_prompt("hi"));
        assert!(is_low_value_prompt("<system-reminder>stuff</system-reminder>"));
        assert!(!is_low_value_prompt("please refactor the parser module"));
    }

    #[test]
    fn file_path_pattern_extracts_write_and_edit_paths() {
        let caps = FILE_PATH_PATTERN.captures("Created/wrote file: /src/lib.rs").unwrap();
        assert_eq!(&caps[1], "/src/lib.rs");
        let caps = FILE_PATH_PATTERN
            .captures("Edited file: /src/main.rs\n  Changed: \"a\" -> \"b\"")
            .unwrap();
        assert_eq!(&caps[1], "/src/main.rs");
    }

    #[test]
    fn render_compaction_summary_stays_under_2000_bytes() {
        use infinite_context_core::model::Category;
        let memories: Vec<NewMemory> = (0..50)
            .map(|i| NewMemory {
                project: "proj".to_string(),
                session_id: "sess".to_string(),
                category: Category::Decision,
                content: format!("decision number {i} with some extra filler text to pad it out"),
                keywords: String::new(),
                score: 0.5,
                source_hash: None,
                metadata: None,
            })
            .collect();
        let summary = render_compaction_summary("proj", &memories);
        assert!(summary.len() <= 2000);
        assert!(summary.starts_with("CONTEXT ARCHIVE (from infinite-context):"));
    }

    #[test]
    fn truncate_to_token_budget_is_noop_under_ceiling() {
        let text = "short text";
        assert_eq!(truncate_to_token_budget(text, 600, 500), text);
    }

    #[test]
    fn truncate_to_token_budget_drops_trailing_lines_over_ceiling() {
        let text = (0..400).map(|i| format!("line {i} of moderately long filler content")).collect::<Vec<_>>().join("\n");
        let truncated = truncate_to_token_budget(&text, 600, 500);
        assert!(estimate_tokens(&truncated) <= 500);
        assert!(truncated.len() < text.len());
    }
}
