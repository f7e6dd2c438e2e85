//! Configuration parsing and validation.
//!
//! Recall is configured via a TOML file at `<config_dir>/config.toml`. The
//! config defines the session stores to crawl, embedding settings, watcher
//! behavior, and search tuning. A missing config file yields the defaults;
//! an unreadable or invalid file aborts daemon startup.
//!
//! # Stores
//!
//! Each `[stores.jsonl.<tag>]` section declares one generic JSONL store: a
//! root directory whose first-level subdirectories are projects and whose
//! matching files are session transcripts. `[stores].enabled` filters which
//! tags are actually registered.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Well-known file names under the config directory.
pub const CONFIG_FILE: &str = "config.toml";
pub const SOCKET_FILE: &str = "indexer.sock";
pub const INDEX_DB_FILE: &str = "index.db";
pub const EMBEDDINGS_DB_FILE: &str = "embeddings.db";
pub const INSTANCE_FILE: &str = "instance.json";
pub const MODEL_DIR: &str = "model";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoresConfig {
    /// Source tags to register. Empty means "all configured stores".
    #[serde(default)]
    pub enabled: Vec<String>,
    /// Generic JSONL stores, keyed by source tag.
    #[serde(default)]
    pub jsonl: BTreeMap<String, JsonlStoreConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JsonlStoreConfig {
    /// Directory whose first-level subdirectories are projects.
    pub root: PathBuf,
    /// Glob patterns for session files within a project directory.
    #[serde(default = "default_session_globs")]
    pub include_globs: Vec<String>,
}

fn default_session_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_overlap")]
    pub chunk_overlap: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_model(),
            chunk_max_chars: default_max_chars(),
            chunk_overlap: default_overlap(),
        }
    }
}

fn default_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_max_chars() -> usize {
    2000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Upper bound on concurrent file scans during literal search.
    #[serde(default = "default_max_scans")]
    pub max_concurrent_scans: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: default_max_scans(),
        }
    }
}

fn default_max_scans() -> usize {
    20
}

impl Config {
    /// Source tags that should be registered, honoring the enabled filter.
    pub fn enabled_sources(&self) -> Vec<String> {
        if self.stores.enabled.is_empty() {
            self.stores.jsonl.keys().cloned().collect()
        } else {
            self.stores
                .enabled
                .iter()
                .filter(|tag| self.stores.jsonl.contains_key(*tag))
                .cloned()
                .collect()
        }
    }
}

/// Resolve the config directory: `$RECALL_CONFIG_DIR`, else `~/.recall`.
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RECALL_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".recall")
}

/// Load and validate the configuration under `config_dir`.
///
/// A missing `config.toml` yields [`Config::default`]; any other read or
/// parse failure is an error that aborts startup.
pub fn load_config(config_dir: &Path) -> Result<Config> {
    let path = config_dir.join(CONFIG_FILE);

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config: {}", path.display()))
        }
    };

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;

    if config.embedding.chunk_max_chars == 0 {
        anyhow::bail!("embedding.chunk_max_chars must be > 0");
    }
    if config.embedding.chunk_overlap >= config.embedding.chunk_max_chars {
        anyhow::bail!("embedding.chunk_overlap must be < embedding.chunk_max_chars");
    }
    if config.embedding.enabled && config.embedding.model.is_empty() {
        anyhow::bail!("embedding.model must be set when embedding is enabled");
    }
    if config.search.max_concurrent_scans == 0 {
        anyhow::bail!("search.max_concurrent_scans must be > 0");
    }

    for tag in &config.stores.enabled {
        if !config.stores.jsonl.contains_key(tag) {
            anyhow::bail!("stores.enabled lists '{}' but no store defines it", tag);
        }
    }

    Ok(config)
}
