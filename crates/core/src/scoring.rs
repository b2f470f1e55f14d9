//! Scoring
//!
//! Pure functions: base memory score, live importance (recency × frequency),
//! keyword extraction, and a cheap token-count estimate. No I/O, no global
//! state — constants hoisted to the top, one test per formula.

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::model::Category;

/// Default weight applied to a category the config doesn't name explicitly.
const DEFAULT_CATEGORY_WEIGHT: f64 = 0.4;

/// Content length beyond which it stops contributing to the base score.
const CONTENT_LENGTH_CAP_BYTES: f64 = 500.0;
const CONTENT_LENGTH_CONTRIBUTION_CAP: f64 = 0.1;

/// Half-life of the recency curve, in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;

/// Maximum distinct keywords kept per `extractKeywords` call.
const MAX_KEYWORDS: usize = 30;

/// Rough characters-per-token ratio used for the token estimate. Not meant
/// to match any particular tokenizer — just a consistent, cheap proxy the
/// restorer can budget against.
const CHARS_PER_TOKEN: f64 = 3.5;

/// Category's configured base weight, or [`DEFAULT_CATEGORY_WEIGHT`] if the
/// config doesn't name it (also what an unrecognized stored category falls
/// back to).
pub fn category_weight(config: &Config, category: Category) -> f64 {
    config
        .category_weights
        .get(category.as_str())
        .copied()
        .unwrap_or(DEFAULT_CATEGORY_WEIGHT)
}

/// Base persistent importance for a freshly extracted memory.
///
/// `score = min(1.0, categoryWeight + min(len(content)/500, 0.1))`
pub fn score_memory(config: &Config, category: Category, content: &str) -> f64 {
    let weight = category_weight(config, category);
    let length_bonus = (content.len() as f64 / CONTENT_LENGTH_CAP_BYTES)
        .min(CONTENT_LENGTH_CONTRIBUTION_CAP);
    (weight + length_bonus).min(1.0)
}

/// Live importance: `base · recency · frequency`.
///
/// - `recency` has a 7-day half-life computed from `last_accessed`.
/// - `frequency` grows with `log2(access_count + 1) + 1`.
/// - `base` is the memory's persistent score, defaulting to `0.5` only when
///   genuinely absent (a stored `0.0` score is preserved).
/// - Returns `base` unchanged (never NaN/inf) if either timestamp is
///   non-finite — in practice this only happens if a caller hands in a
///   timestamp built from non-finite arithmetic upstream.
pub fn compute_importance(
    base_score: Option<f64>,
    last_accessed: DateTime<Utc>,
    access_count: i64,
    now: DateTime<Utc>,
) -> f64 {
    let base = base_score.unwrap_or(0.5);

    let elapsed_days = (now - last_accessed).num_milliseconds() as f64 / (1000.0 * 60.0 * 60.0 * 24.0);
    if !elapsed_days.is_finite() {
        return base;
    }
    let freshness_days = elapsed_days.max(0.01);

    let recency = (-std::f64::consts::LN_2 * freshness_days / RECENCY_HALF_LIFE_DAYS).exp();
    let frequency = ((access_count.max(0) + 1) as f64).log2() + 1.0;

    if !recency.is_finite() || !frequency.is_finite() {
        return base;
    }
    base * recency * frequency
}

/// Normalize free text into the space-separated keyword string the FTS
/// index and the extractor's `keywords` field both use.
///
/// Lowercases, keeps `[a-z 0-9 а-я ё _ - . /]`, drops tokens of length ≤ 2
/// and stopwords, dedupes preserving first-seen order, caps at
/// [`MAX_KEYWORDS`].
pub fn extract_keywords(text: &str, config: &Config) -> String {
    let lowered = text.to_lowercase();
    let filtered: String = lowered
        .chars()
        .map(|c| {
            if c.is_whitespace()
                || c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, '_' | '-' | '.' | '/')
                || ('а'..='я').contains(&c)
                || c == 'ё'
            {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();
    for token in filtered.split_whitespace() {
        if token.chars().count() <= 2 {
            continue;
        }
        if config.stopwords.contains(token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            keywords.push(token.to_string());
            if keywords.len() >= MAX_KEYWORDS {
                break;
            }
        }
    }
    keywords.join(" ")
}

/// Approximate token count: `ceil(len(text) / 3.5)`.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn score_memory_caps_at_one() {
        let config = Config::default();
        let long_content = "x".repeat(10_000);
        let score = score_memory(&config, Category::Architecture, &long_content);
        assert!(score <= 1.0);
    }

    #[test]
    fn score_memory_default_weight_for_unknown_category_path() {
        // category_weight directly exercises the fallback since Category
        // only has six known variants; simulate an unconfigured category
        // by removing it from the map.
        let mut config = Config::default();
        config.category_weights.remove("note");
        assert_eq!(category_weight(&config, Category::Note), DEFAULT_CATEGORY_WEIGHT);
    }

    #[test]
    fn compute_importance_is_finite_for_far_future_timestamp() {
        let now = Utc::now();
        let last_accessed = now - Duration::days(3650);
        let importance = compute_importance(Some(0.8), last_accessed, 0, now);
        assert!(importance.is_finite());
        assert!(importance >= 0.0);
    }

    #[test]
    fn compute_importance_preserves_zero_base_score() {
        let now = Utc::now();
        let importance = compute_importance(Some(0.0), now, 0, now);
        assert_eq!(importance, 0.0);
    }

    #[test]
    fn compute_importance_defaults_missing_base_to_half() {
        let now = Utc::now();
        let with_none = compute_importance(None, now, 0, now);
        let with_half = compute_importance(Some(0.5), now, 0, now);
        assert_eq!(with_none, with_half);
    }

    #[test]
    fn compute_importance_rewards_frequency() {
        let now = Utc::now();
        let low_freq = compute_importance(Some(0.5), now, 0, now);
        let high_freq = compute_importance(Some(0.5), now, 10, now);
        assert!(high_freq > low_freq);
    }

    #[test]
    fn compute_importance_half_life_is_seven_days() {
        let now = Utc::now();
        let week_old = now - Duration::days(7);
        let fresh = compute_importance(Some(1.0), now, 0, now);
        let aged = compute_importance(Some(1.0), week_old, 0, now);
        assert!((aged - fresh / 2.0).abs() < 0.01);
    }

    #[test]
    fn extract_keywords_drops_short_tokens_and_stopwords() {
        let config = Config::default();
        let kw = extract_keywords("the cat and a dog ran to x", &config);
        // "dog" and "ran" survive; "the"/"and" (stopwords) and "a"/"to"/"x"
        // (length <= 2) are dropped.
        assert_eq!(kw, "cat dog ran");
    }

    #[test]
    fn extract_keywords_preserves_cyrillic() {
        let config = Config::default();
        let kw = extract_keywords("привет мир", &config);
        assert_eq!(kw, "привет мир");
    }

    #[test]
    fn extract_keywords_dedupes_preserving_order() {
        let config = Config::default();
        let kw = extract_keywords("alpha beta alpha gamma", &config);
        assert_eq!(kw, "alpha beta gamma");
    }

    #[test]
    fn extract_keywords_caps_at_thirty() {
        let config = Config::default();
        let text: String = (0..50).map(|i| format!("word{i} ")).collect();
        let kw = extract_keywords(&text, &config);
        assert_eq!(kw.split_whitespace().count(), 30);
    }

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens("abc"), 1); // 3/3.5 -> ceil -> 1
        assert_eq!(estimate_tokens(""), 0);
    }
}
