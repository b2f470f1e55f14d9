//! Shared data model: memories, checkpoints, sessions.
//!
//! These types cross every component boundary (extractor produces them,
//! the store persists them, the restorer ranks and renders them) so they
//! live in one place rather than being re-declared per module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum content length in bytes after truncation.
pub const MAX_CONTENT_BYTES: usize = 500;

/// The fixed category set. Unknown categories (e.g. from a future producer)
/// are accepted by storage but route into [`Category::Note`] on restore and
/// use the default scoring weight — see `scoring::category_weight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Architecture,
    Decision,
    Error,
    Finding,
    FileChange,
    Note,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Architecture => "architecture",
            Category::Decision => "decision",
            Category::Error => "error",
            Category::Finding => "finding",
            Category::FileChange => "file_change",
            Category::Note => "note",
        }
    }

    /// Parse a category name, defaulting unknown values to `None` so callers
    /// can decide between "unknown category" (bucket as note) and an error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "architecture" => Some(Category::Architecture),
            "decision" => Some(Category::Decision),
            "error" => Some(Category::Error),
            "finding" => Some(Category::Finding),
            "file_change" => Some(Category::FileChange),
            "note" => Some(Category::Note),
            _ => None,
        }
    }

    pub fn all() -> [Category; 6] {
        [
            Category::Architecture,
            Category::Decision,
            Category::Error,
            Category::Finding,
            Category::FileChange,
            Category::Note,
        ]
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single remembered fact, as read back from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: i64,
    pub project: String,
    pub session_id: String,
    /// Stored as free text so unknown categories round-trip; use
    /// [`Memory::category`] to get the parsed, restore-safe value.
    pub category: String,
    pub content: String,
    pub keywords: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
    pub source_hash: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl Memory {
    /// Parsed category, falling back to [`Category::Note`] for anything
    /// storage accepted but that isn't one of the six known values.
    pub fn category(&self) -> Category {
        Category::parse(&self.category).unwrap_or(Category::Note)
    }
}

/// A memory not yet assigned an id or timestamps — what the extractor
/// produces and what `Storage::insert_memory` consumes.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub project: String,
    pub session_id: String,
    pub category: Category,
    pub content: String,
    pub keywords: String,
    pub score: f64,
    pub source_hash: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewMemory {
    /// Truncate `content` to [`MAX_CONTENT_BYTES`] on a UTF-8 boundary.
    pub fn truncate_content(mut self) -> Self {
        self.content = truncate_utf8(&self.content, MAX_CONTENT_BYTES);
        self
    }
}

/// Truncate `s` to at most `max_bytes` bytes without splitting a UTF-8
/// character in half.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// The parser's resumption cursor for one (session, transcript) pair.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: i64,
    pub session_id: String,
    pub transcript_path: String,
    pub last_line_number: u64,
    pub created_at: DateTime<Utc>,
}

/// A conversation, possibly a subagent (`parent:agent_id`).
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub memories_created: i64,
    pub compactions: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips() {
        for c in Category::all() {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
    }

    #[test]
    fn unknown_category_is_none() {
        assert_eq!(Category::parse("bogus"), None);
    }

    #[test]
    fn truncate_respects_utf8_boundaries() {
        let s = "a".repeat(10) + &"\u{1F600}".repeat(5);
        let truncated = truncate_utf8(&s, 12);
        assert!(std::str::from_utf8(truncated.as_bytes()).is_ok());
    }

    #[test]
    fn truncate_short_string_is_noop() {
        assert_eq!(truncate_utf8("hello", 500), "hello");
    }
}
