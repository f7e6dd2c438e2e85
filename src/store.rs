//! Store abstraction for per-vendor transcript layouts.
//!
//! A [`Store`] adapts one assistant vendor's on-disk session layout to the
//! indexer: it enumerates projects and sessions and opens a session as a
//! lazy stream of entries. The daemon never touches vendor formats directly;
//! everything flows through this capability set, and new vendors are added
//! by implementing it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              StoreRegistry               │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ │
//! │  │ jsonl:   │ │ jsonl:   │ │  Custom  │ │
//! │  │ claude   │ │ codex    │ │  (Rust)  │ │
//! │  └──────────┘ └──────────┘ └──────────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!       ingester → index + embeddings
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{Entry, Project, SessionMeta};
use crate::store_jsonl::JsonlStore;

/// Lazy reader over one session's entries.
///
/// Yields entries in file order; `Ok(None)` marks end of stream. Closing is
/// handled by `Drop`. Implementations log and skip malformed lines rather
/// than failing the stream.
pub trait SessionReader: Send {
    fn next_entry(&mut self) -> Result<Option<Entry>>;
}

/// A session store for one vendor's on-disk layout.
#[async_trait]
pub trait Store: Send + Sync {
    /// Source tag identifying this store (e.g. `"claude"`). Scopes every
    /// project and session id the store produces.
    fn source(&self) -> &str;

    /// Enumerate all projects this store knows about.
    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Enumerate the sessions of one project (store-native project id).
    async fn list_sessions(&self, project_id: &str) -> Result<Vec<SessionMeta>>;

    /// Open a session as a lazy entry stream (store-native session id).
    async fn open_session(&self, session_id: &str) -> Result<Box<dyn SessionReader>>;
}

/// Registry mapping source tags to store implementations.
///
/// Use [`StoreRegistry::from_config`] to build a registry pre-loaded with
/// every configured store that passes the enabled-sources filter, then
/// optionally [`register`](StoreRegistry::register) custom ones.
pub struct StoreRegistry {
    stores: Vec<Arc<dyn Store>>,
}

impl StoreRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { stores: Vec::new() }
    }

    /// Build a registry from the config, honoring `stores.enabled`.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for tag in config.enabled_sources() {
            if let Some(cfg) = config.stores.jsonl.get(&tag) {
                registry.register(Arc::new(JsonlStore::new(tag, cfg.clone())));
            }
        }
        registry
    }

    /// Register a store. A later registration with the same source tag
    /// shadows the earlier one for [`get`](StoreRegistry::get).
    pub fn register(&mut self, store: Arc<dyn Store>) {
        self.stores.push(store);
    }

    /// Find a store by source tag.
    pub fn get(&self, source: &str) -> Option<&Arc<dyn Store>> {
        self.stores.iter().rev().find(|s| s.source() == source)
    }

    /// All registered stores, in registration order.
    pub fn stores(&self) -> &[Arc<dyn Store>] {
        &self.stores
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JsonlStoreConfig;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_config_applies_enabled_filter() {
        let mut jsonl = BTreeMap::new();
        jsonl.insert(
            "claude".to_string(),
            JsonlStoreConfig {
                root: "/tmp/a".into(),
                include_globs: vec!["**/*.jsonl".to_string()],
            },
        );
        jsonl.insert(
            "codex".to_string(),
            JsonlStoreConfig {
                root: "/tmp/b".into(),
                include_globs: vec!["**/*.jsonl".to_string()],
            },
        );

        let mut config = Config::default();
        config.stores.jsonl = jsonl;

        let registry = StoreRegistry::from_config(&config);
        assert_eq!(registry.len(), 2);

        config.stores.enabled = vec!["codex".to_string()];
        let registry = StoreRegistry::from_config(&config);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("codex").is_some());
        assert!(registry.get("claude").is_none());
    }
}
