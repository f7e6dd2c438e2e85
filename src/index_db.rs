//! Index database: projects, sessions, entries, sync state.
//!
//! The index is a rebuildable cache over the session stores. It holds no
//! transcript text beyond the truncated first prompt; literal search
//! re-scans the original files using candidates from here, and the
//! embedding pass re-reads entries through the store.
//!
//! Schema:
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `projects` | one row per scoped project id |
//! | `sessions` | session metadata, `entry_count` maintained at ingest |
//! | `entries` | per-entry metrics (no text) |
//! | `sync_state` | per-file watermark `(mtime, size, lines)` |
//!
//! A session's entries are replaced atomically: delete + insert + metadata
//! update run inside one transaction, so readers never observe a partial
//! mix of old and new rows.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use crate::models::{Project, SessionMeta};

/// First prompts are truncated to this many characters before storage.
pub const FIRST_PROMPT_MAX: usize = 200;

/// One `entries` row, as written by the ingester.
#[derive(Debug, Clone)]
pub struct EntryRow {
    pub uuid: String,
    pub session_id: String,
    pub timestamp: i64,
    pub role: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_name: String,
    pub is_error: bool,
    pub word_count: i64,
    pub thinking_len: i64,
    pub line_number: i64,
}

/// One `sync_state` row: the per-file ingest watermark.
#[derive(Debug, Clone)]
pub struct SyncStateRow {
    pub file_path: String,
    pub last_mod_time: i64,
    pub file_size: i64,
    pub lines_read: i64,
    pub last_synced: i64,
}

/// A literal-search candidate: one session joined with its project.
#[derive(Debug, Clone)]
pub struct SessionCandidate {
    pub session_id: String,
    pub path: String,
    pub project_name: String,
    pub source: String,
}

/// A session eligible for the embedding pass.
#[derive(Debug, Clone)]
pub struct SessionRef {
    pub session_id: String,
    pub path: String,
    pub source: String,
}

/// Entry fields rehydrated for semantic search results.
#[derive(Debug, Clone)]
pub struct EntryDetail {
    pub role: String,
    pub timestamp: i64,
    pub tool_name: String,
    pub word_count: i64,
    pub line_number: i64,
}

/// Session fields rehydrated for semantic search results.
#[derive(Debug, Clone)]
pub struct SessionDetail {
    pub project_name: String,
    pub source: String,
    pub path: String,
    pub first_prompt: String,
}

/// Aggregate counts for the `stats` RPC.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IndexStats {
    pub projects: i64,
    pub sessions: i64,
    pub entries: i64,
    pub synced_files: i64,
}

#[derive(Clone)]
pub struct IndexDb {
    pool: SqlitePool,
}

impl IndexDb {
    /// Open (creating if missing) and migrate the index database.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = connect(path).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                source TEXT NOT NULL,
                workspace_id TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                path TEXT NOT NULL,
                model TEXT NOT NULL DEFAULT '',
                first_prompt TEXT NOT NULL DEFAULT '',
                entry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id)
                    DEFERRABLE INITIALLY DEFERRED
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                uuid TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                role TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                tool_name TEXT NOT NULL DEFAULT '',
                is_error INTEGER NOT NULL DEFAULT 0,
                word_count INTEGER NOT NULL DEFAULT 0,
                thinking_len INTEGER NOT NULL DEFAULT 0,
                line_number INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
                    DEFERRABLE INITIALLY DEFERRED
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                file_path TEXT PRIMARY KEY,
                last_mod_time INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                lines_read INTEGER NOT NULL,
                last_synced INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_session_id ON entries(session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_project_id ON sessions(project_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn upsert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, path, name, source, workspace_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                name = excluded.name,
                workspace_id = excluded.workspace_id
            "#,
        )
        .bind(project.scoped_id())
        .bind(&project.path)
        .bind(&project.display_name)
        .bind(&project.source)
        .bind(&project.workspace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sync_state(&self, file_path: &str) -> Result<Option<SyncStateRow>> {
        let row = sqlx::query(
            "SELECT file_path, last_mod_time, file_size, lines_read, last_synced
             FROM sync_state WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SyncStateRow {
            file_path: r.get("file_path"),
            last_mod_time: r.get("last_mod_time"),
            file_size: r.get("file_size"),
            lines_read: r.get("lines_read"),
            last_synced: r.get("last_synced"),
        }))
    }

    /// Atomically replace a session's entries and update its metadata and
    /// sync watermark. This is the visibility boundary for readers: either
    /// the old revision or the new one is observable, never a mix.
    pub async fn replace_session(
        &self,
        meta: &SessionMeta,
        entries: &[EntryRow],
        lines_read: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM entries WHERE session_id = ?")
            .bind(&meta.id)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO entries (uuid, session_id, timestamp, role, input_tokens,
                                     output_tokens, tool_name, is_error, word_count,
                                     thinking_len, line_number)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.uuid)
            .bind(&entry.session_id)
            .bind(entry.timestamp)
            .bind(&entry.role)
            .bind(entry.input_tokens)
            .bind(entry.output_tokens)
            .bind(&entry.tool_name)
            .bind(entry.is_error)
            .bind(entry.word_count)
            .bind(entry.thinking_len)
            .bind(entry.line_number)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO sessions (id, project_id, path, model, first_prompt,
                                  entry_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                path = excluded.path,
                model = excluded.model,
                first_prompt = excluded.first_prompt,
                entry_count = excluded.entry_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&meta.id)
        .bind(&meta.project_scoped_id)
        .bind(&meta.full_path)
        .bind(&meta.model)
        .bind(truncate_chars(&meta.first_prompt, FIRST_PROMPT_MAX))
        .bind(entries.len() as i64)
        .bind(meta.created_at.timestamp())
        .bind(meta.modified_at.timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sync_state (file_path, last_mod_time, file_size, lines_read, last_synced)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                last_mod_time = excluded.last_mod_time,
                file_size = excluded.file_size,
                lines_read = excluded.lines_read,
                last_synced = excluded.last_synced
            "#,
        )
        .bind(&meta.full_path)
        .bind(meta.modified_at.timestamp())
        .bind(meta.file_size)
        .bind(lines_read)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Literal-search candidates: sessions joined with projects, filtered by
    /// an optional project-name substring and source tag.
    pub async fn session_candidates(
        &self,
        filter_project: Option<&str>,
        filter_source: Option<&str>,
    ) -> Result<Vec<SessionCandidate>> {
        let mut sql = String::from(
            "SELECT s.id, s.path, p.name, p.source
             FROM sessions s JOIN projects p ON s.project_id = p.id
             WHERE 1=1",
        );
        if filter_project.is_some() {
            sql.push_str(" AND p.name LIKE '%' || ? || '%'");
        }
        if filter_source.is_some() {
            sql.push_str(" AND p.source = ?");
        }
        sql.push_str(" ORDER BY s.updated_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(project) = filter_project {
            query = query.bind(project);
        }
        if let Some(source) = filter_source {
            query = query.bind(source);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| SessionCandidate {
                session_id: r.get("id"),
                path: r.get("path"),
                project_name: r.get("name"),
                source: r.get("source"),
            })
            .collect())
    }

    /// Session ids permitted by the semantic-search metadata filters.
    pub async fn filtered_session_ids(
        &self,
        filter_project: Option<&str>,
        filter_source: Option<&str>,
    ) -> Result<Vec<String>> {
        Ok(self
            .session_candidates(filter_project, filter_source)
            .await?
            .into_iter()
            .map(|c| c.session_id)
            .collect())
    }

    /// Sessions that currently have at least one entry row.
    pub async fn sessions_with_entries(&self) -> Result<Vec<SessionRef>> {
        let rows = sqlx::query(
            "SELECT s.id, s.path, p.source
             FROM sessions s JOIN projects p ON s.project_id = p.id
             WHERE EXISTS (SELECT 1 FROM entries e WHERE e.session_id = s.id)
             ORDER BY s.updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| SessionRef {
                session_id: r.get("id"),
                path: r.get("path"),
                source: r.get("source"),
            })
            .collect())
    }

    /// Batched rehydration of entry details for semantic search results.
    pub async fn entry_details(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<(String, String), EntryDetail>> {
        let mut out = HashMap::new();
        if pairs.is_empty() {
            return Ok(out);
        }

        let uuids: HashSet<&str> = pairs.iter().map(|(_, uuid)| uuid.as_str()).collect();
        let uuids: Vec<&str> = uuids.into_iter().collect();

        let placeholders = vec!["?"; uuids.len()].join(",");
        let sql = format!(
            "SELECT uuid, session_id, role, timestamp, tool_name, word_count, line_number
             FROM entries WHERE uuid IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for uuid in &uuids {
            query = query.bind(*uuid);
        }

        for row in query.fetch_all(&self.pool).await? {
            let key = (row.get::<String, _>("session_id"), row.get::<String, _>("uuid"));
            out.insert(
                key,
                EntryDetail {
                    role: row.get("role"),
                    timestamp: row.get("timestamp"),
                    tool_name: row.get("tool_name"),
                    word_count: row.get("word_count"),
                    line_number: row.get("line_number"),
                },
            );
        }
        Ok(out)
    }

    /// Batched rehydration of session details for semantic search results.
    pub async fn session_details(
        &self,
        session_ids: &[String],
    ) -> Result<HashMap<String, SessionDetail>> {
        let mut out = HashMap::new();
        if session_ids.is_empty() {
            return Ok(out);
        }

        let placeholders = vec!["?"; session_ids.len()].join(",");
        let sql = format!(
            "SELECT s.id, s.path, s.first_prompt, p.name, p.source
             FROM sessions s JOIN projects p ON s.project_id = p.id
             WHERE s.id IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for id in session_ids {
            query = query.bind(id);
        }

        for row in query.fetch_all(&self.pool).await? {
            out.insert(
                row.get::<String, _>("id"),
                SessionDetail {
                    project_name: row.get("name"),
                    source: row.get("source"),
                    path: row.get("path"),
                    first_prompt: row.get("first_prompt"),
                },
            );
        }
        Ok(out)
    }

    /// Drop every sync watermark, forcing the next sweep to re-ingest all.
    pub async fn clear_sync_state(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_state")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn entry_count(&self, session_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let projects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&self.pool)
            .await?;
        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        let synced_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_state")
            .fetch_one(&self.pool)
            .await?;
        Ok(IndexStats {
            projects,
            sessions,
            entries,
            synced_files,
        })
    }
}

/// Truncate to at most `max` characters without splitting a scalar.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    // No ATTACH of foreign files and no extension loading: the index only
    // ever sees its own file.
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .pragma("trusted_schema", "off");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    async fn open_db() -> (tempfile::TempDir, IndexDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = IndexDb::open(&tmp.path().join("index.db")).await.unwrap();
        (tmp, db)
    }

    fn project(id: &str, name: &str, source: &str) -> Project {
        Project {
            id: id.to_string(),
            path: format!("/data/{}", id),
            display_name: name.to_string(),
            source: source.to_string(),
            workspace_id: String::new(),
        }
    }

    fn meta(session: &str, project_scoped: &str, path: &str) -> SessionMeta {
        SessionMeta {
            id: session.to_string(),
            project_scoped_id: project_scoped.to_string(),
            full_path: path.to_string(),
            model: "sonnet".to_string(),
            first_prompt: "hello".to_string(),
            entry_count: 0,
            created_at: Utc.timestamp_opt(1000, 0).unwrap(),
            modified_at: Utc.timestamp_opt(2000, 0).unwrap(),
            file_size: 64,
            source: "claude".to_string(),
            workspace_id: String::new(),
            git_branch: String::new(),
        }
    }

    fn entry_row(uuid: &str, session: &str, line: i64) -> EntryRow {
        EntryRow {
            uuid: uuid.to_string(),
            session_id: session.to_string(),
            timestamp: 2000,
            role: "user".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            tool_name: String::new(),
            is_error: false,
            word_count: 2,
            thinking_len: 0,
            line_number: line,
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.db");
        let db = IndexDb::open(&path).await.unwrap();
        db.close().await;
        let db = IndexDb::open(&path).await.unwrap();
        assert_eq!(db.stats().await.unwrap().projects, 0);
    }

    #[tokio::test]
    async fn test_replace_session_updates_counts_and_watermark() {
        let (_tmp, db) = open_db().await;
        db.upsert_project(&project("p1", "alpha", "claude"))
            .await
            .unwrap();

        let m = meta("s1", "claude:p1", "/data/p1/s1.jsonl");
        db.replace_session(
            &m,
            &[entry_row("u1", "s1", 1), entry_row("u2", "s1", 2)],
            3,
        )
        .await
        .unwrap();

        assert_eq!(db.entry_count("s1").await.unwrap(), 2);
        let state = db.sync_state("/data/p1/s1.jsonl").await.unwrap().unwrap();
        assert_eq!(state.lines_read, 3);
        assert_eq!(state.file_size, 64);
        assert_eq!(state.last_mod_time, 2000);

        // Re-ingesting replaces, never accumulates.
        db.replace_session(&m, &[entry_row("u3", "s1", 1)], 1)
            .await
            .unwrap();
        assert_eq!(db.entry_count("s1").await.unwrap(), 1);

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_candidates_filtering() {
        let (_tmp, db) = open_db().await;
        db.upsert_project(&project("p1", "alpha", "claude"))
            .await
            .unwrap();
        db.upsert_project(&project("p2", "beta", "codex"))
            .await
            .unwrap();
        db.replace_session(&meta("s1", "claude:p1", "/a/s1.jsonl"), &[], 0)
            .await
            .unwrap();
        db.replace_session(&meta("s2", "codex:p2", "/b/s2.jsonl"), &[], 0)
            .await
            .unwrap();

        let all = db.session_candidates(None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let alpha = db.session_candidates(Some("alph"), None).await.unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].session_id, "s1");
        assert_eq!(alpha[0].project_name, "alpha");

        let codex = db.session_candidates(None, Some("codex")).await.unwrap();
        assert_eq!(codex.len(), 1);
        assert_eq!(codex[0].session_id, "s2");

        let none = db
            .session_candidates(Some("alph"), Some("codex"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_with_entries() {
        let (_tmp, db) = open_db().await;
        db.upsert_project(&project("p1", "alpha", "claude"))
            .await
            .unwrap();
        db.replace_session(
            &meta("s1", "claude:p1", "/a/s1.jsonl"),
            &[entry_row("u1", "s1", 1)],
            1,
        )
        .await
        .unwrap();
        db.replace_session(&meta("s2", "claude:p1", "/a/s2.jsonl"), &[], 0)
            .await
            .unwrap();

        let eligible = db.sessions_with_entries().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].session_id, "s1");
        assert_eq!(eligible[0].source, "claude");
    }

    #[tokio::test]
    async fn test_rehydration_lookups() {
        let (_tmp, db) = open_db().await;
        db.upsert_project(&project("p1", "alpha", "claude"))
            .await
            .unwrap();
        db.replace_session(
            &meta("s1", "claude:p1", "/a/s1.jsonl"),
            &[entry_row("u1", "s1", 1), entry_row("u2", "s1", 2)],
            2,
        )
        .await
        .unwrap();

        let details = db
            .entry_details(&[("s1".to_string(), "u2".to_string())])
            .await
            .unwrap();
        let d = details.get(&("s1".to_string(), "u2".to_string())).unwrap();
        assert_eq!(d.line_number, 2);
        assert_eq!(d.role, "user");

        let sessions = db.session_details(&["s1".to_string()]).await.unwrap();
        let s = sessions.get("s1").unwrap();
        assert_eq!(s.project_name, "alpha");
        assert_eq!(s.source, "claude");
        assert_eq!(s.first_prompt, "hello");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 4), "abcd");
        assert_eq!(truncate_chars("ab", 4), "ab");
        assert_eq!(truncate_chars("ééééé", 3), "ééé");
    }
}
