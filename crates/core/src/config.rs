//! Configuration
//!
//! A single process-wide, lazily-initialized [`Config`] value, merged with
//! optional per-project overrides. Loading is tolerant: a missing or
//! malformed `config.json` falls back to defaults rather than failing the
//! caller — a hook must never die because its config file is corrupt.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_RESTORE_TOKENS: u32 = 4000;
const DEFAULT_MAX_MEMORIES_PER_RESTORE: u32 = 20;
const DEFAULT_MAX_PROMPT_RECALL_RESULTS: u32 = 5;
const DEFAULT_DECAY_FACTOR: f64 = 0.95;
const DEFAULT_DECAY_INTERVAL_DAYS: u32 = 1;
const DEFAULT_PRUNE_THRESHOLD: f64 = 0.05;
const DEFAULT_SCORE_FLOOR: f64 = 0.01;
const DEFAULT_MAX_MEMORIES_PER_PROJECT: u32 = 5000;

fn default_category_weights() -> HashMap<String, f64> {
    [
        ("architecture", 0.8),
        ("decision", 0.7),
        ("error", 0.6),
        ("finding", 0.6),
        ("file_change", 0.4),
        ("note", 0.3),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_stopwords() -> HashSet<String> {
    const WORDS: &[&str] = &[
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was",
        "one", "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now",
        "old", "see", "two", "way", "who", "boy", "did", "its", "let", "put", "say", "she",
        "too", "use", "that", "this", "with", "from", "have", "they", "will", "would", "there",
        "their", "what", "about", "which", "when", "make", "like", "into", "just", "then",
        "than", "them", "were", "been", "being", "some", "could", "should",
    ];
    WORDS.iter().map(|w| w.to_string()).collect()
}

/// The recognized configuration options, defaulted and validated.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_restore_tokens: u32,
    pub max_memories_per_restore: u32,
    pub max_prompt_recall_results: u32,
    pub decay_factor: f64,
    pub decay_interval_days: u32,
    pub prune_threshold: f64,
    pub score_floor: f64,
    pub max_memories_per_project: u32,
    pub category_weights: HashMap<String, f64>,
    pub stopwords: HashSet<String>,
    pub projects: HashMap<String, ProjectOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_restore_tokens: DEFAULT_MAX_RESTORE_TOKENS,
            max_memories_per_restore: DEFAULT_MAX_MEMORIES_PER_RESTORE,
            max_prompt_recall_results: DEFAULT_MAX_PROMPT_RECALL_RESULTS,
            decay_factor: DEFAULT_DECAY_FACTOR,
            decay_interval_days: DEFAULT_DECAY_INTERVAL_DAYS,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            score_floor: DEFAULT_SCORE_FLOOR,
            max_memories_per_project: DEFAULT_MAX_MEMORIES_PER_PROJECT,
            category_weights: default_category_weights(),
            stopwords: default_stopwords(),
            projects: HashMap::new(),
        }
    }
}

/// A partial, per-project configuration override. Every field is optional;
/// absent fields fall through to the global [`Config`]. `category_weights`
/// is the one field that *deep*-merges (per-category) rather than replacing
/// the whole map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectOverride {
    pub max_restore_tokens: Option<u32>,
    pub max_memories_per_restore: Option<u32>,
    pub max_prompt_recall_results: Option<u32>,
    pub decay_factor: Option<f64>,
    pub decay_interval_days: Option<u32>,
    pub prune_threshold: Option<f64>,
    pub score_floor: Option<f64>,
    pub max_memories_per_project: Option<u32>,
    pub category_weights: Option<HashMap<String, f64>>,
}

impl Config {
    /// Shallow-merge the global config with `project`'s override
    /// (category weights deep-merged).
    pub fn for_project(&self, project: &str) -> Config {
        let Some(ov) = self.projects.get(project) else {
            return self.clone();
        };
        let mut merged = self.clone();
        if let Some(v) = ov.max_restore_tokens {
            merged.max_restore_tokens = v;
        }
        if let Some(v) = ov.max_memories_per_restore {
            merged.max_memories_per_restore = v;
        }
        if let Some(v) = ov.max_prompt_recall_results {
            merged.max_prompt_recall_results = v;
        }
        if let Some(v) = ov.decay_factor {
            merged.decay_factor = v;
        }
        if let Some(v) = ov.decay_interval_days {
            merged.decay_interval_days = v;
        }
        if let Some(v) = ov.prune_threshold {
            merged.prune_threshold = v;
        }
        if let Some(v) = ov.score_floor {
            merged.score_floor = v;
        }
        if let Some(v) = ov.max_memories_per_project {
            merged.max_memories_per_project = v;
        }
        if let Some(weights) = &ov.category_weights {
            for (k, v) in weights {
                merged.category_weights.insert(k.clone(), *v);
            }
        }
        merged
    }

    /// Sanitized decay interval: never less than one day.
    pub fn decay_interval_days_sanitized(&self) -> i64 {
        self.decay_interval_days.max(1) as i64
    }
}

/// The on-disk shape of `config.json`. Every field is optional so an old or
/// hand-edited file with missing keys still parses; unknown keys are
/// silently ignored (serde's default behavior without `deny_unknown_fields`).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    max_restore_tokens: Option<serde_json::Value>,
    max_memories_per_restore: Option<serde_json::Value>,
    max_prompt_recall_results: Option<serde_json::Value>,
    decay_factor: Option<serde_json::Value>,
    decay_interval_days: Option<serde_json::Value>,
    prune_threshold: Option<serde_json::Value>,
    score_floor: Option<serde_json::Value>,
    max_memories_per_project: Option<serde_json::Value>,
    category_weights: Option<HashMap<String, f64>>,
    stopwords: Option<Vec<String>>,
    projects: Option<HashMap<String, ProjectOverride>>,
}

/// Parse a positive integer field, falling back to `default` if the value
/// is missing, non-finite, or less than 1.
fn validated_u32(v: &Option<serde_json::Value>, default: u32) -> u32 {
    match v.as_ref().and_then(|v| v.as_f64()) {
        Some(n) if n.is_finite() && n >= 1.0 => n as u32,
        _ => default,
    }
}

/// Parse a fraction field in `[0, 1]`, falling back to `default` otherwise.
fn validated_fraction(v: &Option<serde_json::Value>, default: f64) -> f64 {
    match v.as_ref().and_then(|v| v.as_f64()) {
        Some(n) if n.is_finite() && (0.0..=1.0).contains(&n) => n,
        _ => default,
    }
}

impl Config {
    /// Build a validated `Config` from raw JSON text, falling back to
    /// per-field defaults on anything malformed (never the whole file).
    fn from_raw(raw: RawConfig) -> Config {
        let defaults = Config::default();
        Config {
            max_restore_tokens: validated_u32(&raw.max_restore_tokens, defaults.max_restore_tokens),
            max_memories_per_restore: validated_u32(
                &raw.max_memories_per_restore,
                defaults.max_memories_per_restore,
            ),
            max_prompt_recall_results: validated_u32(
                &raw.max_prompt_recall_results,
                defaults.max_prompt_recall_results,
            ),
            decay_factor: validated_fraction(&raw.decay_factor, defaults.decay_factor),
            decay_interval_days: validated_u32(
                &raw.decay_interval_days,
                defaults.decay_interval_days,
            ),
            prune_threshold: validated_fraction(&raw.prune_threshold, defaults.prune_threshold),
            score_floor: validated_fraction(&raw.score_floor, defaults.score_floor),
            max_memories_per_project: validated_u32(
                &raw.max_memories_per_project,
                defaults.max_memories_per_project,
            ),
            category_weights: {
                let mut weights = defaults.category_weights;
                if let Some(overrides) = raw.category_weights {
                    weights.extend(overrides);
                }
                weights
            },
            stopwords: raw
                .stopwords
                .map(|words| words.into_iter().collect())
                .unwrap_or(defaults.stopwords),
            projects: raw.projects.unwrap_or_default(),
        }
    }

    /// Load and validate a `Config` from `path`. Never fails: a missing or
    /// unparseable file logs and returns [`Config::default`].
    pub fn load(path: &Path) -> Config {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(_) => return Config::default(),
        };
        match serde_json::from_str::<RawConfig>(&text) {
            Ok(raw) => Config::from_raw(raw),
            Err(e) => {
                tracing::warn!("[infinite-context] malformed config.json, using defaults: {e}");
                Config::default()
            }
        }
    }
}

/// Root data directory: `$INFINITE_CONTEXT_HOME` if set, else the
/// platform-specific user data directory under `infinite-context/`.
pub fn data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("INFINITE_CONTEXT_HOME") {
        return PathBuf::from(home);
    }
    directories::ProjectDirs::from("", "", "infinite-context")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".infinite-context"))
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

static CACHED: OnceLock<Mutex<Option<Config>>> = OnceLock::new();

/// The cached, process-wide configuration. First call reads disk; later
/// calls return the cached clone until [`reset`] is invoked.
pub fn get() -> Config {
    let cell = CACHED.get_or_init(|| Mutex::new(None));
    let mut guard = cell.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_none() {
        *guard = Some(Config::load(&config_path()));
    }
    guard.as_ref().expect("just populated").clone()
}

/// Discard the cached config so the next [`get`] call re-reads disk.
/// Exists for test determinism.
pub fn reset() {
    if let Some(cell) = CACHED.get() {
        *cell.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// [`get`] merged with `project`'s override.
pub fn get_project_config(project: &str) -> Config {
    get().for_project(project)
}

/// Write `config` to `path` atomically (temp file + rename), so a crash
/// mid-write cannot corrupt an existing config. Exposed for the
/// out-of-scope CLI/dashboard consumers; the hook path never writes config.
pub fn save_atomic(config_path: &Path, config: &Config) -> std::io::Result<()> {
    let json = serde_json::json!({
        "maxRestoreTokens": config.max_restore_tokens,
        "maxMemoriesPerRestore": config.max_memories_per_restore,
        "maxPromptRecallResults": config.max_prompt_recall_results,
        "decayFactor": config.decay_factor,
        "decayIntervalDays": config.decay_interval_days,
        "pruneThreshold": config.prune_threshold,
        "scoreFloor": config.score_floor,
        "maxMemoriesPerProject": config.max_memories_per_project,
        "categoryWeights": config.category_weights,
        "stopwords": config.stopwords.iter().collect::<Vec<_>>(),
    });
    let parent = config_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    use std::io::Write;
    tmp.write_all(serde_json::to_string_pretty(&json)?.as_bytes())?;
    tmp.persist(config_path)
        .map_err(|e| std::io::Error::other(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.max_restore_tokens, 4000);
        assert_eq!(c.max_memories_per_restore, 20);
        assert_eq!(c.max_prompt_recall_results, 5);
        assert_eq!(c.decay_factor, 0.95);
        assert_eq!(c.decay_interval_days, 1);
        assert_eq!(c.prune_threshold, 0.05);
        assert_eq!(c.score_floor, 0.01);
        assert_eq!(c.max_memories_per_project, 5000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let c = Config::load(Path::new("/nonexistent/path/config.json"));
        assert_eq!(c, Config::default());
    }

    #[test]
    fn malformed_json_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let c = Config::load(&path);
        assert_eq!(c, Config::default());
    }

    #[test]
    fn out_of_range_fraction_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"decayFactor": 4.5, "pruneThreshold": -1}"#).unwrap();
        let c = Config::load(&path);
        assert_eq!(c.decay_factor, Config::default().decay_factor);
        assert_eq!(c.prune_threshold, Config::default().prune_threshold);
    }

    #[test]
    fn sub_one_integer_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"maxRestoreTokens": 0}"#).unwrap();
        let c = Config::load(&path);
        assert_eq!(c.max_restore_tokens, Config::default().max_restore_tokens);
    }

    #[test]
    fn decay_interval_zero_or_negative_clamps_to_one() {
        let mut c = Config::default();
        c.decay_interval_days = 0;
        assert_eq!(c.decay_interval_days_sanitized(), 1);
    }

    #[test]
    fn project_override_shallow_merges_and_deep_merges_weights() {
        let mut c = Config::default();
        let mut weights = HashMap::new();
        weights.insert("note".to_string(), 0.9);
        c.projects.insert(
            "proj".to_string(),
            ProjectOverride {
                max_restore_tokens: Some(1000),
                category_weights: Some(weights),
                ..Default::default()
            },
        );
        let merged = c.for_project("proj");
        assert_eq!(merged.max_restore_tokens, 1000);
        assert_eq!(merged.category_weights["note"], 0.9);
        // Untouched categories survive the deep merge.
        assert_eq!(merged.category_weights["decision"], Config::default().category_weights["decision"]);
        // Untouched scalar fields survive the shallow merge.
        assert_eq!(merged.max_memories_per_restore, Config::default().max_memories_per_restore);
    }

    #[test]
    fn unknown_project_returns_global_unchanged() {
        let c = Config::default();
        assert_eq!(c.for_project("nope"), c);
    }

    #[test]
    fn reset_forces_reload() {
        reset();
        let _ = get();
        reset();
        // No panic, and a fresh load happens on next get().
        let _ = get();
    }

    #[test]
    fn atomic_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut c = Config::default();
        c.max_restore_tokens = 1234;
        save_atomic(&path, &c).unwrap();
        let loaded = Config::load(&path);
        assert_eq!(loaded.max_restore_tokens, 1234);
    }
}
