//! Generic JSONL session store.
//!
//! Adapts the layout shared by most local assistant tools:
//!
//! ```text
//! <root>/<project-dir>/<session-id>.jsonl
//! ```
//!
//! First-level directories under `root` are projects; files matching the
//! configured globs are sessions; each line of a session file is one entry
//! in the vendor-neutral superset shape (`uuid`, `type`/`role`, `timestamp`,
//! `message.content[]`, `message.usage`, `gitBranch`, `cwd`, ...).
//!
//! # Configuration
//!
//! ```toml
//! [stores.jsonl.claude]
//! root = "/home/me/.claude/projects"
//! include_globs = ["**/*.jsonl"]
//! ```
//!
//! Lines that fail to parse are logged at debug and skipped; lines without
//! a `uuid` come back with an empty uuid and are dropped by the ingester.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::JsonlStoreConfig;
use crate::models::{ContentBlock, Entry, EntryRole, Project, SessionMeta, Usage};
use crate::store::{SessionReader, Store};

pub struct JsonlStore {
    source: String,
    config: JsonlStoreConfig,
}

impl JsonlStore {
    pub fn new(source: String, config: JsonlStoreConfig) -> Self {
        Self { source, config }
    }

    fn include_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.config.include_globs {
            builder.add(Glob::new(pattern)?);
        }
        Ok(builder.build()?)
    }

    /// Locate a session file by its id (file stem) across all projects.
    fn find_session_path(&self, session_id: &str) -> Result<PathBuf> {
        let include = self.include_set()?;
        for entry in WalkDir::new(&self.config.root).min_depth(2) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.config.root)
                .unwrap_or(entry.path());
            if !include.is_match(rel) {
                continue;
            }
            if file_stem(entry.path()) == session_id {
                return Ok(entry.path().to_path_buf());
            }
        }
        bail!("session '{}' not found under {}", session_id, self.config.root.display());
    }
}

#[async_trait]
impl Store for JsonlStore {
    fn source(&self) -> &str {
        &self.source
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let root = &self.config.root;
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut projects = Vec::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("failed to read store root {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            projects.push(Project {
                id: dir_name.clone(),
                path: entry.path().to_string_lossy().to_string(),
                display_name: decode_project_name(&dir_name),
                source: self.source.clone(),
                workspace_id: String::new(),
            });
        }

        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn list_sessions(&self, project_id: &str) -> Result<Vec<SessionMeta>> {
        let project_dir = self.config.root.join(project_id);
        if !project_dir.exists() {
            return Ok(Vec::new());
        }
        let include = self.include_set()?;

        let mut sessions = Vec::new();
        for entry in WalkDir::new(&project_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.config.root)
                .unwrap_or(entry.path());
            if !include.is_match(rel) {
                continue;
            }

            let metadata = entry.metadata()?;
            let modified = system_time_to_utc(metadata.modified().ok());
            let created = system_time_to_utc(metadata.created().ok().or(metadata.modified().ok()));

            sessions.push(SessionMeta {
                id: file_stem(entry.path()),
                project_scoped_id: crate::models::scoped_project_id(&self.source, project_id),
                full_path: entry.path().to_string_lossy().to_string(),
                model: String::new(),
                first_prompt: String::new(),
                entry_count: 0,
                created_at: created,
                modified_at: modified,
                file_size: metadata.len() as i64,
                source: self.source.clone(),
                workspace_id: String::new(),
                git_branch: String::new(),
            });
        }

        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn open_session(&self, session_id: &str) -> Result<Box<dyn SessionReader>> {
        let path = self.find_session_path(session_id)?;
        let file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open session file {}", path.display()))?;
        Ok(Box::new(JsonlSessionReader {
            reader: BufReader::new(file),
            source: self.source.clone(),
            path,
            line: 0,
        }))
    }
}

struct JsonlSessionReader {
    reader: BufReader<std::fs::File>,
    source: String,
    path: PathBuf,
    line: u64,
}

impl SessionReader for JsonlSessionReader {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = self.reader.read_line(&mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            self.line += 1;

            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match parse_entry_line(trimmed, &self.source) {
                Some(entry) => return Ok(Some(entry)),
                None => {
                    debug!(
                        path = %self.path.display(),
                        line = self.line,
                        "skipping unparseable session line"
                    );
                }
            }
        }
    }
}

/// Parse one transcript line into an [`Entry`].
///
/// Returns `None` only when the line is not a JSON object; unknown types
/// and missing fields degrade to defaults so the line still counts.
pub fn parse_entry_line(line: &str, source: &str) -> Option<Entry> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if !value.is_object() {
        return None;
    }

    let role_tag = value
        .get("type")
        .or_else(|| value.get("role"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let role = EntryRole::parse(role_tag).unwrap_or(EntryRole::System);

    let message = value.get("message");

    let content_blocks: Vec<ContentBlock> = message
        .and_then(|m| m.get("content"))
        .map(|content| match content {
            serde_json::Value::Array(blocks) => blocks
                .iter()
                .map(|b| ContentBlock::from_value(b.clone()))
                .collect(),
            serde_json::Value::String(s) => vec![ContentBlock::Text { text: s.clone() }],
            _ => Vec::new(),
        })
        .unwrap_or_default();

    // Top-level toolUseResult lines carry tool output outside message.content.
    let mut content_blocks = content_blocks;
    if let Some(tool_result) = value.get("toolUseResult") {
        let text = match tool_result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !text.is_empty() {
            content_blocks.push(ContentBlock::ToolResult {
                tool_result: text,
                is_error: false,
            });
        }
    }

    let text = value
        .get("text")
        .or_else(|| value.get("summary"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let timestamp = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());

    let usage = message
        .and_then(|m| m.get("usage"))
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

    Some(Entry {
        uuid: str_at(&value, "uuid"),
        parent_uuid: value
            .get("parentUuid")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        timestamp,
        role,
        text,
        content_blocks,
        usage,
        model: message
            .and_then(|m| m.get("model"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        git_branch: str_at(&value, "gitBranch"),
        cwd: str_at(&value, "cwd"),
        is_sidechain: value
            .get("isSidechain")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        is_checkpoint: role == EntryRole::Checkpoint
            || value
                .get("isCheckpoint")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        source: source.to_string(),
        workspace_id: String::new(),
    })
}

fn str_at(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn system_time_to_utc(time: Option<std::time::SystemTime>) -> DateTime<Utc> {
    time.and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| {
            Utc.timestamp_opt(d.as_secs() as i64, d.subsec_nanos())
                .unwrap()
        })
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Best-effort decode of a path-encoded project directory name
/// (`-Users-me-dev-app` becomes `/Users/me/dev/app`).
fn decode_project_name(dir_name: &str) -> String {
    if dir_name.starts_with('-') {
        dir_name.replace('-', "/")
    } else {
        dir_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_session(root: &Path, project: &str, session: &str, lines: &[&str]) -> PathBuf {
        let dir = root.join(project);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.jsonl", session));
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn store(root: &Path) -> JsonlStore {
        JsonlStore::new(
            "claude".to_string(),
            JsonlStoreConfig {
                root: root.to_path_buf(),
                include_globs: vec!["**/*.jsonl".to_string()],
            },
        )
    }

    #[tokio::test]
    async fn test_list_projects_and_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        write_session(
            tmp.path(),
            "-home-me-app",
            "abc",
            &[r#"{"type":"user","uuid":"u1","text":"hello there friend"}"#],
        );
        write_session(tmp.path(), "-home-me-app", "def", &[]);
        fs::write(tmp.path().join("stray.jsonl"), "").unwrap();

        let store = store(tmp.path());
        let projects = store.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "-home-me-app");
        assert_eq!(projects[0].display_name, "/home/me/app");
        assert_eq!(projects[0].scoped_id(), "claude:-home-me-app");

        let sessions = store.list_sessions("-home-me-app").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "abc");
        assert!(sessions[0].full_path.ends_with("abc.jsonl"));
    }

    #[tokio::test]
    async fn test_open_session_reads_entries_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_session(
            tmp.path(),
            "proj",
            "s1",
            &[
                r#"{"type":"user","uuid":"u1","timestamp":"2026-01-01T10:00:00Z","message":{"role":"user","content":[{"type":"text","text":"fix the login bug"}]}}"#,
                "not json at all",
                r#"{"type":"assistant","uuid":"u2","parentUuid":"u1","message":{"model":"sonnet","content":[{"type":"text","text":"looking into it now"}],"usage":{"input_tokens":10,"output_tokens":5}}}"#,
            ],
        );

        let store = store(tmp.path());
        let mut reader = store.open_session("s1").await.unwrap();

        let e1 = reader.next_entry().unwrap().unwrap();
        assert_eq!(e1.uuid, "u1");
        assert_eq!(e1.role, EntryRole::User);

        // The malformed line is skipped, not surfaced.
        let e2 = reader.next_entry().unwrap().unwrap();
        assert_eq!(e2.uuid, "u2");
        assert_eq!(e2.role, EntryRole::Assistant);
        assert_eq!(e2.model, "sonnet");
        assert_eq!(e2.parent_uuid.as_deref(), Some("u1"));
        assert_eq!(e2.usage.as_ref().unwrap().input_tokens, 10);

        assert!(reader.next_entry().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_session_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        assert!(store.open_session("nope").await.is_err());
    }

    #[test]
    fn test_parse_entry_line_uuidless() {
        let entry = parse_entry_line(r#"{"type":"summary","summary":"compacted"}"#, "claude");
        assert_eq!(entry.unwrap().uuid, "");
    }
}
