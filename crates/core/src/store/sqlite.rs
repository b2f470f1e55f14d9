//! SQLite storage
//!
//! A single connection behind one mutex. A reader/writer split earns its
//! keep in a long-lived server fielding concurrent requests; every caller
//! here is a short-lived hook process making a handful of sequential calls,
//! so that split buys nothing and one connection is simpler to reason about.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::Config;
use crate::model::{Category, Checkpoint, Memory, NewMemory, Session};

use super::migrations::apply_migrations;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store initialization failed: {0}")]
    Init(String),
    #[error("store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Sort key for [`Storage::list_memories_paginated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Score,
    Created,
    Accessed,
    AccessCount,
    Id,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            SortField::Score => "score",
            SortField::Created => "created_at",
            SortField::Accessed => "last_accessed",
            SortField::AccessCount => "access_count",
            SortField::Id => "id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter/sort/page parameters for the dashboard's paginated memory list.
#[derive(Debug, Clone, Default)]
pub struct ListQuery<'a> {
    pub project: Option<&'a str>,
    pub category: Option<&'a str>,
    pub search: Option<&'a str>,
    pub sort: Option<SortField>,
    pub order: Option<SortOrder>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct CategoryStat {
    pub category: String,
    pub count: u64,
    pub avg_score: f64,
}

/// Durable storage: memories, the FTS index, checkpoints, sessions, meta.
pub struct Storage {
    conn: Mutex<Option<Connection>>,
}

impl Storage {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (creating and migrating if necessary) the store at `path`.
    /// Parent directory and the file itself are restricted to owner-only on
    /// Unix, matching a personal knowledge store's confidentiality profile.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Init(format!("failed to open {}: {e}", path.display())))?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }

        Self::configure_connection(&conn)?;
        apply_migrations(&conn)
            .map_err(|e| StoreError::Init(format!("migration failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open the store at the default, config-derived location.
    pub fn open_default() -> Result<Self> {
        let path: PathBuf = crate::config::data_dir().join("memories.db");
        Self::open(&path)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    /// Idempotent: a second call on an already-closed store is a no-op.
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    // -- memories ---------------------------------------------------------

    /// Insert `m`. Returns `None` without inserting if `source_hash` is set
    /// and a row with that hash already exists.
    pub fn insert_memory(&self, m: &NewMemory) -> Result<Option<i64>> {
        self.with_conn(|conn| insert_one(conn, m))
    }

    /// Insert every item of `ms` under one transaction; a failed row rolls
    /// back the whole batch. Returns the count actually inserted
    /// (duplicates by `source_hash` count as 0).
    pub fn insert_many(&self, ms: &[NewMemory]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut inserted = 0;
            for m in ms {
                if insert_one(&tx, m)?.is_some() {
                    inserted += 1;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    /// Ordered by `score DESC`, limited by `limit` or the config default.
    pub fn get_top_memories(
        &self,
        project: &str,
        limit: Option<u32>,
        config: &Config,
    ) -> Result<Vec<Memory>> {
        let limit = limit.unwrap_or(config.max_memories_per_restore);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project, session_id, category, content, keywords, score,
                        created_at, last_accessed, access_count, source_hash, metadata
                 FROM memories WHERE project = ?1 ORDER BY score DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![project, limit], row_to_memory)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Sanitize `query` for the FTS index and search it, optionally scoped
    /// to `project`. Returns `[]` on an empty sanitized query or an index
    /// parse error rather than raising.
    pub fn search(&self, query: &str, project: Option<&str>, limit: u32) -> Result<Vec<Memory>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = if project.is_some() {
                "SELECT m.id, m.project, m.session_id, m.category, m.content, m.keywords,
                        m.score, m.created_at, m.last_accessed, m.access_count, m.source_hash,
                        m.metadata
                 FROM memories_fts f
                 JOIN memories m ON m.id = f.rowid
                 WHERE memories_fts MATCH ?1 AND m.project = ?2
                 ORDER BY rank LIMIT ?3"
            } else {
                "SELECT m.id, m.project, m.session_id, m.category, m.content, m.keywords,
                        m.score, m.created_at, m.last_accessed, m.access_count, m.source_hash,
                        m.metadata
                 FROM memories_fts f
                 JOIN memories m ON m.id = f.rowid
                 WHERE memories_fts MATCH ?1
                 ORDER BY rank LIMIT ?2"
            };
            let mut stmt = conn.prepare(sql)?;
            let result = if let Some(project) = project {
                stmt.query_map(params![sanitized, project, limit], row_to_memory)
                    .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
            } else {
                stmt.query_map(params![sanitized, limit], row_to_memory)
                    .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
            };
            match result {
                Ok(rows) => Ok(rows),
                // FTS5 syntax errors surface as SQLITE_ERROR; treat as "no results".
                Err(_) => Ok(Vec::new()),
            }
        })
    }

    /// `access_count += 1`, `last_accessed = now`, asymptotic score bump.
    /// Missing ids are silent no-ops.
    pub fn touch_memories(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE memories
                     SET access_count = access_count + 1,
                         last_accessed = ?1,
                         score = MIN(1.0, score + 0.02 * (1.0 - score))
                     WHERE id = ?2",
                )?;
                for id in ids {
                    stmt.execute(params![now, id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Decay scores for rows stale past the configured interval, then
    /// delete anything that fell below the prune threshold. Returns the
    /// delete count.
    pub fn decay_and_prune(&self, config: &Config) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(config.decay_interval_days_sanitized());
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE memories
                 SET score = MAX(?1, score * ?2)
                 WHERE last_accessed < ?3",
                params![config.score_floor, config.decay_factor, cutoff.to_rfc3339()],
            )?;
            let deleted = tx.execute(
                "DELETE FROM memories WHERE score < ?1",
                params![config.prune_threshold],
            )?;
            tx.commit()?;
            Ok(deleted as u64)
        })
    }

    /// Delete untouched (`access_count = 0`) rows older than `days`
    /// (default 30, floor 1).
    pub fn prune_old(&self, days: Option<f64>) -> Result<u64> {
        let days = days.unwrap_or(30.0).round().max(1.0) as i64;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM memories WHERE created_at < ?1 AND access_count = 0",
                params![cutoff.to_rfc3339()],
            )? as u64)
        })
    }

    pub fn prune_below_score(&self, threshold: f64) -> Result<u64> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM memories WHERE score < ?1", params![threshold])? as u64)
        })
    }

    pub fn count_below_score(&self, threshold: f64) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE score < ?1",
                params![threshold],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(StoreError::from)
        })
    }

    pub fn count_old(&self, days: Option<f64>) -> Result<u64> {
        let days = days.unwrap_or(30.0).round().max(1.0) as i64;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE created_at < ?1 AND access_count = 0",
                params![cutoff.to_rfc3339()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(StoreError::from)
        })
    }

    /// Delete lowest-score rows in `project` until its count is at most
    /// the configured per-project cap.
    pub fn enforce_project_limit(&self, project: &str, config: &Config) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE project = ?1",
                params![project],
                |row| row.get(0),
            )?;
            let over = count - config.max_memories_per_project as i64;
            if over <= 0 {
                return Ok(0);
            }
            let deleted = conn.execute(
                "DELETE FROM memories WHERE id IN (
                     SELECT id FROM memories WHERE project = ?1 ORDER BY score ASC LIMIT ?2
                 )",
                params![project, over],
            )?;
            Ok(deleted as u64)
        })
    }

    // -- checkpoints --------------------------------------------------------

    pub fn save_checkpoint(&self, session: &str, transcript_path: &str, line_no: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints (session_id, transcript_path, last_line_number, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session, transcript_path, line_no as i64, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// The checkpoint with the greatest id for `(session, path)`; different
    /// paths maintain independent checkpoints.
    pub fn get_checkpoint(&self, session: &str, transcript_path: &str) -> Result<Option<Checkpoint>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, session_id, transcript_path, last_line_number, created_at
                 FROM checkpoints WHERE session_id = ?1 AND transcript_path = ?2
                 ORDER BY id DESC LIMIT 1",
                params![session, transcript_path],
                |row| {
                    Ok(Checkpoint {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        transcript_path: row.get(2)?,
                        last_line_number: row.get::<_, i64>(3)? as u64,
                        created_at: parse_rfc3339(row.get::<_, String>(4)?)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    // -- sessions -----------------------------------------------------------

    /// Insert a session row if absent; otherwise only `project` is updated.
    pub fn upsert_session(&self, session_id: &str, project: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, project, started_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET project = excluded.project",
                params![session_id, project, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn incr_session_memories(&self, session_id: &str, n: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET memories_created = memories_created + ?1 WHERE session_id = ?2",
                params![n, session_id],
            )?;
            Ok(())
        })
    }

    pub fn incr_session_compactions(&self, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET compactions = compactions + 1 WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
    }

    pub fn end_session(&self, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET ended_at = ?1 WHERE session_id = ?2",
                params![Utc::now().to_rfc3339(), session_id],
            )?;
            Ok(())
        })
    }

    pub fn all_sessions(&self) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, project, started_at, ended_at, memories_created, compactions
                 FROM sessions ORDER BY started_at DESC",
            )?;
            let rows = stmt
                .query_map([], row_to_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- dashboard-facing reads ----------------------------------------------

    /// Paginated memory listing; returns `(page, total matching rows)`.
    pub fn list_memories_paginated(&self, q: &ListQuery<'_>) -> Result<(Vec<Memory>, u64)> {
        let limit = q.limit.min(200).max(1);
        let page = q.page.max(1);
        let offset = (page - 1) as i64 * limit as i64;
        let sort = q.sort.unwrap_or(SortField::Score).column();
        let order = q.order.unwrap_or(SortOrder::Desc).sql();

        self.with_conn(|conn| {
            let mut where_clauses = Vec::new();
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(project) = q.project {
                where_clauses.push("project = ?".to_string());
                binds.push(Box::new(project.to_string()));
            }
            if let Some(category) = q.category {
                where_clauses.push("category = ?".to_string());
                binds.push(Box::new(category.to_string()));
            }
            if let Some(search) = q.search {
                where_clauses.push("content LIKE ?".to_string());
                binds.push(Box::new(format!("%{search}%")));
            }
            let where_sql = if where_clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", where_clauses.join(" AND "))
            };

            let count_sql = format!("SELECT COUNT(*) FROM memories {where_sql}");
            let param_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let total: i64 =
                conn.query_row(&count_sql, param_refs.as_slice(), |row| row.get(0))?;

            let list_sql = format!(
                "SELECT id, project, session_id, category, content, keywords, score,
                        created_at, last_accessed, access_count, source_hash, metadata
                 FROM memories {where_sql}
                 ORDER BY {sort} {order}
                 LIMIT ? OFFSET ?"
            );
            let mut all_binds = binds;
            all_binds.push(Box::new(limit as i64));
            all_binds.push(Box::new(offset));
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                all_binds.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&list_sql)?;
            let rows = stmt
                .query_map(param_refs.as_slice(), row_to_memory)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok((rows, total as u64))
        })
    }

    pub fn category_stats(&self, project: Option<&str>) -> Result<Vec<CategoryStat>> {
        self.with_conn(|conn| {
            let sql = if project.is_some() {
                "SELECT category, COUNT(*), AVG(score) FROM memories WHERE project = ?1 GROUP BY category"
            } else {
                "SELECT category, COUNT(*), AVG(score) FROM memories GROUP BY category"
            };
            let mut stmt = conn.prepare(sql)?;
            let map_row = |row: &rusqlite::Row| {
                Ok(CategoryStat {
                    category: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                    avg_score: row.get(2)?,
                })
            };
            let rows = if let Some(project) = project {
                stmt.query_map(params![project], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                stmt.query_map([], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            Ok(rows)
        })
    }

    /// 10-bucket histogram over `[0.0, 1.0]` scores.
    pub fn score_histogram(&self, project: Option<&str>) -> Result<[u64; 10]> {
        self.with_conn(|conn| {
            let sql = if project.is_some() {
                "SELECT score FROM memories WHERE project = ?1"
            } else {
                "SELECT score FROM memories"
            };
            let mut stmt = conn.prepare(sql)?;
            let scores: Vec<f64> = if let Some(project) = project {
                stmt.query_map(params![project], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                stmt.query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            let mut buckets = [0u64; 10];
            for score in scores {
                let idx = ((score * 10.0) as usize).min(9);
                buckets[idx] += 1;
            }
            Ok(buckets)
        })
    }

    /// Memory counts per day over the last `days` days (`YYYY-MM-DD` keys).
    pub fn timeline_by_day(&self, project: Option<&str>, days: u32) -> Result<Vec<(String, u64)>> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        self.with_conn(|conn| {
            let sql = if project.is_some() {
                "SELECT substr(created_at, 1, 10) AS day, COUNT(*)
                 FROM memories WHERE project = ?1 AND created_at >= ?2
                 GROUP BY day ORDER BY day"
            } else {
                "SELECT substr(created_at, 1, 10) AS day, COUNT(*)
                 FROM memories WHERE created_at >= ?1
                 GROUP BY day ORDER BY day"
            };
            let map_row = |row: &rusqlite::Row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            };
            let rows = if let Some(project) = project {
                conn.prepare(sql)?
                    .query_map(params![project, cutoff.to_rfc3339()], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                conn.prepare(sql)?
                    .query_map(params![cutoff.to_rfc3339()], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            Ok(rows)
        })
    }
}

fn insert_one(conn: &Connection, m: &NewMemory) -> Result<Option<i64>> {
    let now = Utc::now().to_rfc3339();
    let metadata_json = match &m.metadata {
        Some(v) => Some(serde_json::to_string(v).map_err(|e| StoreError::Init(e.to_string()))?),
        None => None,
    };
    let changed = conn.execute(
        "INSERT OR IGNORE INTO memories
             (project, session_id, category, content, keywords, score, created_at,
              last_accessed, access_count, source_hash, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, ?8, ?9)",
        params![
            m.project,
            m.session_id,
            m.category.as_str(),
            m.content,
            m.keywords,
            m.score,
            now,
            m.source_hash,
            metadata_json,
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let metadata_json: Option<String> = row.get(11)?;
    let metadata = metadata_json.and_then(|s| serde_json::from_str(&s).ok());
    Ok(Memory {
        id: row.get(0)?,
        project: row.get(1)?,
        session_id: row.get(2)?,
        category: row.get(3)?,
        content: row.get(4)?,
        keywords: row.get(5)?,
        score: row.get(6)?,
        created_at: parse_rfc3339(row.get::<_, String>(7)?)?,
        last_accessed: parse_rfc3339(row.get::<_, String>(8)?)?,
        access_count: row.get(9)?,
        source_hash: row.get(10)?,
        metadata,
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let ended_at: Option<String> = row.get(3)?;
    Ok(Session {
        session_id: row.get(0)?,
        project: row.get(1)?,
        started_at: parse_rfc3339(row.get::<_, String>(2)?)?,
        ended_at: ended_at.map(parse_rfc3339).transpose()?,
        memories_created: row.get(4)?,
        compactions: row.get(5)?,
    })
}

fn parse_rfc3339(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

/// Sanitize `query` for the FTS5 index: split on whitespace, drop tokens of
/// length 1, strip index metacharacters, double embedded quotes, wrap each
/// surviving token in quotes, join with OR. Empty input yields `""`.
pub fn sanitize_fts5_query(query: &str) -> String {
    const METACHARS: &[char] = &['*', '^', '{', '}', '[', ']', '(', ')', ':', '~', '!'];
    let tokens: Vec<String> = query
        .split_whitespace()
        .filter_map(|token| {
            let stripped: String = token.chars().filter(|c| !METACHARS.contains(c)).collect();
            if stripped.chars().count() <= 1 {
                return None;
            }
            let escaped = stripped.replace('"', "\"\"");
            Some(format!("\"{escaped}\""))
        })
        .collect();
    tokens.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewMemory;

    fn temp_storage() -> Storage {
        let dir = tempfile::tempdir().unwrap();
        Storage::open(&dir.path().join("memory.db")).unwrap()
    }

    fn new_memory(project: &str, content: &str, hash: Option<&str>) -> NewMemory {
        NewMemory {
            project: project.to_string(),
            session_id: "sess".to_string(),
            category: Category::Note,
            content: content.to_string(),
            keywords: "alpha beta".to_string(),
            score: 0.5,
            source_hash: hash.map(str::to_string),
            metadata: None,
        }
    }

    #[test]
    fn insert_and_dedup_by_source_hash() {
        let store = temp_storage();
        let m = new_memory("proj", "hello", Some("hash1"));
        let first = store.insert_memory(&m).unwrap();
        assert!(first.is_some());
        let second = store.insert_memory(&m).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn insert_many_counts_only_new_rows() {
        let store = temp_storage();
        let batch = vec![
            new_memory("proj", "a", Some("h1")),
            new_memory("proj", "b", Some("h2")),
            new_memory("proj", "c", Some("h3")),
        ];
        assert_eq!(store.insert_many(&batch).unwrap(), 3);
        assert_eq!(store.insert_many(&batch).unwrap(), 0);
    }

    #[test]
    fn get_top_memories_orders_by_score_desc() {
        let store = temp_storage();
        let mut low = new_memory("proj", "low", Some("h1"));
        low.score = 0.1;
        let mut high = new_memory("proj", "high", Some("h2"));
        high.score = 0.9;
        store.insert_memory(&low).unwrap();
        store.insert_memory(&high).unwrap();
        let config = Config::default();
        let top = store.get_top_memories("proj", None, &config).unwrap();
        assert_eq!(top[0].content, "high");
    }

    #[test]
    fn search_empty_sanitized_query_returns_empty() {
        let store = temp_storage();
        assert!(store.search("* ^ :", None, 10).unwrap().is_empty());
    }

    #[test]
    fn search_finds_inserted_content() {
        let store = temp_storage();
        let m = new_memory("proj", "the quick brown fox", Some("h1"));
        store.insert_memory(&m).unwrap();
        let results = store.search("quick fox", Some("proj"), 10).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn touch_memories_bumps_score_and_access_count() {
        let store = temp_storage();
        let m = new_memory("proj", "content", Some("h1"));
        let id = store.insert_memory(&m).unwrap().unwrap();
        store.touch_memories(&[id]).unwrap();
        let config = Config::default();
        let top = store.get_top_memories("proj", None, &config).unwrap();
        assert_eq!(top[0].access_count, 1);
        assert!(top[0].score > 0.5);
    }

    #[test]
    fn touch_memories_missing_id_is_noop() {
        let store = temp_storage();
        store.touch_memories(&[9999]).unwrap();
    }

    #[test]
    fn enforce_project_limit_deletes_lowest_scores() {
        let store = temp_storage();
        let mut config = Config::default();
        config.max_memories_per_project = 2;
        for i in 0..5 {
            let mut m = new_memory("proj", "x", Some(&format!("h{i}")));
            m.score = i as f64 / 10.0;
            store.insert_memory(&m).unwrap();
        }
        let deleted = store.enforce_project_limit("proj", &config).unwrap();
        assert_eq!(deleted, 3);
        let remaining = store.get_top_memories("proj", Some(10), &config).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn checkpoint_round_trips_and_tracks_greatest_id() {
        let store = temp_storage();
        store.save_checkpoint("sess", "/t.jsonl", 5).unwrap();
        store.save_checkpoint("sess", "/t.jsonl", 10).unwrap();
        let cp = store.get_checkpoint("sess", "/t.jsonl").unwrap().unwrap();
        assert_eq!(cp.last_line_number, 10);
    }

    #[test]
    fn different_paths_track_independent_checkpoints() {
        let store = temp_storage();
        store.save_checkpoint("sess", "/a.jsonl", 5).unwrap();
        store.save_checkpoint("sess", "/b.jsonl", 9).unwrap();
        assert_eq!(store.get_checkpoint("sess", "/a.jsonl").unwrap().unwrap().last_line_number, 5);
        assert_eq!(store.get_checkpoint("sess", "/b.jsonl").unwrap().unwrap().last_line_number, 9);
    }

    #[test]
    fn session_upsert_and_counters() {
        let store = temp_storage();
        store.upsert_session("sess", "proj").unwrap();
        store.incr_session_memories("sess", 3).unwrap();
        store.incr_session_compactions("sess").unwrap();
        store.end_session("sess").unwrap();
        let sessions = store.all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].memories_created, 3);
        assert_eq!(sessions[0].compactions, 1);
        assert!(sessions[0].ended_at.is_some());
    }

    #[test]
    fn close_is_idempotent() {
        let store = temp_storage();
        store.close();
        store.close();
        assert!(matches!(store.insert_memory(&new_memory("p", "c", None)), Err(StoreError::Closed)));
    }

    #[test]
    fn sanitize_fts5_query_strips_metacharacters_and_short_tokens() {
        assert_eq!(sanitize_fts5_query("foo* a bar:baz"), "\"foo\" OR \"barbaz\"");
    }

    #[test]
    fn sanitize_fts5_query_doubles_embedded_quotes() {
        assert_eq!(sanitize_fts5_query("he said \"hi\""), "\"he\" OR \"said\" OR \"\"\"hi\"\"\"");
    }
}
