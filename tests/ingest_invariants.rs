//! Ingest and embedding invariants exercised against real temp stores.

mod common;

use common::{user_line, write_session};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use recall::config::{Config, JsonlStoreConfig};
use recall::embed_db::EmbedDb;
use recall::embedder::{Embedder, HashEmbedder};
use recall::index_db::IndexDb;
use recall::ingest::{Cancelled, Ingester};
use recall::models::SessionMeta;
use recall::store::{Store, StoreRegistry};
use recall::store_jsonl::JsonlStore;

fn store_config(root: &Path) -> Config {
    let mut config = Config::default();
    let mut jsonl = BTreeMap::new();
    jsonl.insert(
        "claude".to_string(),
        JsonlStoreConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.jsonl".to_string()],
        },
    );
    config.stores.jsonl = jsonl;
    config
}

async fn setup(
    root: &Path,
    db_dir: &Path,
) -> (Config, IndexDb, Arc<StoreRegistry>) {
    let config = store_config(root);
    let index = IndexDb::open(&db_dir.join("index.db")).await.unwrap();
    let registry = Arc::new(StoreRegistry::from_config(&config));
    (config, index, registry)
}

async fn session_meta(registry: &StoreRegistry, project: &str, session: &str) -> SessionMeta {
    let store = registry.get("claude").unwrap();
    store
        .list_sessions(project)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.id == session)
        .unwrap()
}

/// Sessions reference their project row; upsert it the way a sweep would.
async fn upsert_project(index: &IndexDb, registry: &StoreRegistry, project: &str) {
    let store = registry.get("claude").unwrap();
    let found = store
        .list_projects()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id == project)
        .unwrap();
    index.upsert_project(&found).await.unwrap();
}

#[tokio::test]
async fn test_ingest_counts_match_lines_read() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("store");
    // Two message lines plus one uuid-less summary line.
    write_session(
        &root,
        "proj",
        "s1",
        &[
            user_line("u1", "first prompt with enough text"),
            r#"{"type":"summary","summary":"compacted context"}"#.to_string(),
            user_line("u2", "second prompt with enough text"),
        ],
    );

    let (config, index, registry) = setup(&root, tmp.path()).await;
    let ingester = Ingester::new(&config, index.clone(), None, None, Arc::clone(&registry));
    upsert_project(&index, &registry, "proj").await;

    let meta = session_meta(&registry, "proj", "s1").await;
    let changed = ingester.ingest_session("claude:proj", &meta).await.unwrap();
    assert!(changed);

    // entries.count == lines_read - skipped (the summary line has no uuid).
    assert_eq!(index.entry_count("s1").await.unwrap(), 2);
    let state = index.sync_state(&meta.full_path).await.unwrap().unwrap();
    assert_eq!(state.lines_read, 3);

    let stats = index.stats().await.unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.entries, 2);
}

#[tokio::test]
async fn test_unchanged_file_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("store");
    write_session(&root, "proj", "s1", &[user_line("u1", "some prompt text here")]);

    let (config, index, registry) = setup(&root, tmp.path()).await;
    let ingester = Ingester::new(&config, index.clone(), None, None, Arc::clone(&registry));
    upsert_project(&index, &registry, "proj").await;

    let meta = session_meta(&registry, "proj", "s1").await;
    assert!(ingester.ingest_session("claude:proj", &meta).await.unwrap());

    // Same mtime and size: the fast path returns without writing.
    let meta = session_meta(&registry, "proj", "s1").await;
    assert!(!ingester.ingest_session("claude:proj", &meta).await.unwrap());
}

#[tokio::test]
async fn test_reingest_replaces_previous_revision() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("store");
    write_session(&root, "proj", "s1", &[user_line("u1", "original revision text")]);

    let (config, index, registry) = setup(&root, tmp.path()).await;
    let ingester = Ingester::new(&config, index.clone(), None, None, Arc::clone(&registry));
    upsert_project(&index, &registry, "proj").await;

    let meta = session_meta(&registry, "proj", "s1").await;
    ingester.ingest_session("claude:proj", &meta).await.unwrap();

    // Rewrite with different content (size changes, so mtime granularity
    // does not matter).
    write_session(
        &root,
        "proj",
        "s1",
        &[
            user_line("u2", "replacement revision, first line"),
            user_line("u3", "replacement revision, second line"),
        ],
    );

    let meta = session_meta(&registry, "proj", "s1").await;
    assert!(ingester.ingest_session("claude:proj", &meta).await.unwrap());

    assert_eq!(index.entry_count("s1").await.unwrap(), 2);
    let details = index
        .entry_details(&[
            ("s1".to_string(), "u1".to_string()),
            ("s1".to_string(), "u2".to_string()),
            ("s1".to_string(), "u3".to_string()),
        ])
        .await
        .unwrap();
    assert!(!details.contains_key(&("s1".to_string(), "u1".to_string())));
    assert!(details.contains_key(&("s1".to_string(), "u2".to_string())));
    assert!(details.contains_key(&("s1".to_string(), "u3".to_string())));
}

#[tokio::test]
async fn test_embedding_pass_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("store");
    write_session(
        &root,
        "proj",
        "s1",
        &[
            user_line("u1", "a long prompt that will certainly be embedded"),
            user_line("u2", "another prompt that will also be embedded"),
        ],
    );

    let (config, index, registry) = setup(&root, tmp.path()).await;
    let embed_db = EmbedDb::open(&tmp.path().join("embeddings.db")).await.unwrap();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(16));
    let ingester = Ingester::new(
        &config,
        index.clone(),
        Some(embed_db.clone()),
        Some(Arc::clone(&embedder)),
        Arc::clone(&registry),
    );

    // Index first, then embed.
    let project = registry.get("claude").unwrap().list_projects().await.unwrap();
    let cancel = CancellationToken::new();
    ingester
        .ingest_project(&cancel, &project[0], 1, 1)
        .await
        .unwrap();

    let summary = ingester.embed_all_sessions(&cancel).await.unwrap();
    assert_eq!(summary.sessions, 1);
    assert!(summary.chunks >= 2);
    assert!(summary.tokens > 0);

    let rows_first = embed_db.all_rows_brief().await.unwrap();
    assert!(!rows_first.is_empty());
    for (id, _, vector) in &rows_first {
        assert!(id.starts_with("claude:s1:"));
        assert_eq!(vector.len(), 16);
    }

    // A second pass sees no eligible sessions and changes nothing.
    let summary = ingester.embed_all_sessions(&cancel).await.unwrap();
    assert_eq!(summary.sessions, 0);
    let rows_second = embed_db.all_rows_brief().await.unwrap();
    assert_eq!(rows_first, rows_second);
}

#[tokio::test]
async fn test_model_migration_before_pass() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("store");
    write_session(&root, "proj", "s1", &[user_line("u1", "text worth embedding here")]);

    let (config, index, registry) = setup(&root, tmp.path()).await;
    let embed_db = EmbedDb::open(&tmp.path().join("embeddings.db")).await.unwrap();

    // First pass with one model.
    let old: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(8));
    let ingester = Ingester::new(
        &config,
        index.clone(),
        Some(embed_db.clone()),
        Some(old),
        Arc::clone(&registry),
    );
    let cancel = CancellationToken::new();
    let projects = registry.get("claude").unwrap().list_projects().await.unwrap();
    ingester.ingest_project(&cancel, &projects[0], 1, 1).await.unwrap();
    ingester.embed_all_sessions(&cancel).await.unwrap();
    assert!(embed_db.count_for_model("hash-8").await.unwrap() > 0);

    // Second pass with a different model deletes the foreign rows first.
    let new: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(16));
    let ingester = Ingester::new(
        &config,
        index.clone(),
        Some(embed_db.clone()),
        Some(new),
        Arc::clone(&registry),
    );
    ingester.embed_all_sessions(&cancel).await.unwrap();
    assert_eq!(embed_db.count_for_model("hash-8").await.unwrap(), 0);
    assert!(embed_db.count_for_model("hash-16").await.unwrap() > 0);
}

#[tokio::test]
async fn test_cancellation_between_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("store");
    write_session(&root, "proj", "s1", &[user_line("u1", "some session text here")]);

    let (config, index, registry) = setup(&root, tmp.path()).await;
    let ingester = Ingester::new(&config, index.clone(), None, None, Arc::clone(&registry));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let projects = registry.get("claude").unwrap().list_projects().await.unwrap();
    let err = ingester
        .ingest_project(&cancel, &projects[0], 1, 1)
        .await
        .unwrap_err();
    assert!(err.is::<Cancelled>());

    // Nothing was ingested.
    assert_eq!(index.stats().await.unwrap().entries, 0);
}
