//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use recall::daemon::{launch, DaemonHandle, DaemonOptions};
use recall::embedder::{Embedder, HashEmbedder};

/// Write a daemon config pointing at `store_root` as a single jsonl store.
pub fn write_config(config_dir: &Path, store_root: &Path, embedding_enabled: bool) {
    let content = format!(
        r#"
[stores.jsonl.claude]
root = "{}"

[embedding]
enabled = {}

[watcher]
enabled = false
"#,
        store_root.display(),
        embedding_enabled
    );
    fs::write(config_dir.join("config.toml"), content).unwrap();
}

/// Write one session transcript under `store_root/<project>/<session>.jsonl`.
pub fn write_session(store_root: &Path, project: &str, session: &str, lines: &[String]) -> PathBuf {
    let dir = store_root.join(project);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.jsonl", session));
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

/// A user entry line in the generic transcript shape.
pub fn user_line(uuid: &str, text: &str) -> String {
    format!(
        r#"{{"type":"user","uuid":"{}","timestamp":"2026-01-01T10:00:00Z","message":{{"role":"user","content":[{{"type":"text","text":"{}"}}]}}}}"#,
        uuid, text
    )
}

/// Launch a daemon over `config_dir` with the deterministic hash embedder.
pub async fn start_daemon(config_dir: &Path) -> DaemonHandle {
    let mut options = DaemonOptions::new(config_dir.to_path_buf());
    options.watch = false;
    options.embedder_factory =
        Arc::new(|_, _| Ok(Arc::new(HashEmbedder::new(16)) as Arc<dyn Embedder>));
    launch(options).await.unwrap()
}

/// Wait for indexed data to be visible: a `sync` call either joins the
/// initial sync or runs a (cheap) fresh one, and returns once complete.
pub async fn sync_and_wait(handle: &DaemonHandle) -> serde_json::Value {
    recall::client::call(
        handle.socket_path(),
        "sync",
        serde_json::json!({}),
        |_| {},
    )
    .await
    .unwrap()
}
