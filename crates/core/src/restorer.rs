//! Restorer
//!
//! Turns a ranked memory list into the fixed-template text the host injects
//! back into context. Token accounting is deliberately conservative: a
//! section header "costs" the moment its first item is admitted, so the
//! budget check below never lets a header through without at least one
//! line under it.

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::model::{Category, Memory};
use crate::scoring::{compute_importance, estimate_tokens};

const TOP_HEADER: &str = "## Prior Context (restored from archive)";
const RECALL_HEADER: &str = "## Relevant prior context";

fn section_header(category: Category) -> &'static str {
    match category {
        Category::Architecture => "### Architecture & Design",
        Category::Decision => "### Key Decisions",
        Category::Error => "### Known Issues",
        Category::Finding => "### Findings",
        Category::FileChange => "### Files Modified",
        Category::Note => "### Notes",
    }
}

/// Fixed section order; sections with no admitted items are omitted.
const SECTION_ORDER: [Category; 6] = [
    Category::Architecture,
    Category::Decision,
    Category::Error,
    Category::Finding,
    Category::FileChange,
    Category::Note,
];

pub struct RestoreResult {
    pub text: String,
    pub ids: Vec<i64>,
}

/// Rank `memories` by live importance, walk in that order admitting each
/// one whose marginal token cost (new section header, if any, plus its
/// content line) still fits in `budget`, then render the fixed template.
///
/// `budget` defaults to `config.max_restore_tokens`; an explicit `Some(0)`
/// means "restore nothing". An empty `memories` slice yields an empty
/// result.
pub fn restore_context(memories: &[Memory], budget: Option<u32>, config: &Config, now: DateTime<Utc>) -> RestoreResult {
    let budget = budget.unwrap_or(config.max_restore_tokens) as i64;
    if budget <= 0 || memories.is_empty() {
        return RestoreResult {
            text: String::new(),
            ids: Vec::new(),
        };
    }

    let mut ranked: Vec<&Memory> = memories.iter().collect();
    ranked.sort_by(|a, b| {
        let ia = compute_importance(Some(a.score), a.last_accessed, a.access_count, now);
        let ib = compute_importance(Some(b.score), b.last_accessed, b.access_count, now);
        ib.partial_cmp(&ia).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut total: i64 = estimate_tokens(TOP_HEADER) as i64;
    let mut seen_categories: std::collections::HashSet<Category> = std::collections::HashSet::new();
    let mut by_category: std::collections::HashMap<Category, Vec<&Memory>> = std::collections::HashMap::new();
    let mut ids = Vec::new();

    for memory in ranked {
        let category = memory.category();
        let header_cost = if seen_categories.contains(&category) {
            0
        } else {
            estimate_tokens(section_header(category)) as i64
        };
        let line = format!("- {}\n", memory.content);
        let line_cost = estimate_tokens(&line) as i64;
        let extra = header_cost + line_cost;

        if total + extra > budget {
            break;
        }
        total += extra;
        seen_categories.insert(category);
        by_category.entry(category).or_default().push(memory);
        ids.push(memory.id);
    }

    if by_category.is_empty() {
        return RestoreResult {
            text: String::new(),
            ids: Vec::new(),
        };
    }

    let mut text = String::new();
    text.push_str(TOP_HEADER);
    text.push('\n');
    for category in SECTION_ORDER {
        let Some(items) = by_category.get(&category) else {
            continue;
        };
        text.push('\n');
        text.push_str(section_header(category));
        text.push('\n');
        for item in items {
            text.push_str("- ");
            text.push_str(&item.content);
            text.push('\n');
        }
    }

    RestoreResult { text, ids }
}

/// Render `## Relevant prior context` followed by `- [category] content`
/// lines for each result, in the order given. Empty input yields empty.
pub fn recall_for_prompt(results: &[Memory]) -> RestoreResult {
    if results.is_empty() {
        return RestoreResult {
            text: String::new(),
            ids: Vec::new(),
        };
    }

    let mut text = String::new();
    text.push_str(RECALL_HEADER);
    text.push('\n');
    let mut ids = Vec::new();
    for memory in results {
        text.push_str(&format!("- [{}] {}\n", memory.category().as_str(), memory.content));
        ids.push(memory.id);
    }

    RestoreResult { text, ids }
}
