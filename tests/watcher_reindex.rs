//! Watcher: a write to a session file is debounced and re-ingested without
//! a restart.

mod common;

use common::{user_line, write_session};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use recall::client;
use recall::daemon::DaemonOptions;
use recall::embedder::{Embedder, HashEmbedder};

fn write_watch_config(config_dir: &std::path::Path, store_root: &std::path::Path) {
    let content = format!(
        r#"
[stores.jsonl.claude]
root = "{}"

[watcher]
enabled = true
debounce_ms = 100
"#,
        store_root.display()
    );
    fs::write(config_dir.join("config.toml"), content).unwrap();
}

#[tokio::test]
async fn test_watcher_reingests_changed_session() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    let session_path = write_session(
        &store_root,
        "proj",
        "s1",
        &[user_line("u1", "the original first entry")],
    );
    write_watch_config(tmp.path(), &store_root);

    let mut options = DaemonOptions::new(tmp.path().to_path_buf());
    options.embedder_factory =
        Arc::new(|_, _| Ok(Arc::new(HashEmbedder::new(16)) as Arc<dyn Embedder>));
    let handle = recall::daemon::launch(options).await.unwrap();

    // Settle the initial sync.
    client::call(handle.socket_path(), "sync", json!({}), |_| {})
        .await
        .unwrap();
    let stats = client::call(handle.socket_path(), "stats", json!({}), |_| {})
        .await
        .unwrap();
    assert_eq!(stats["entries"], 1);

    let status = client::call(handle.socket_path(), "status", json!({}), |_| {})
        .await
        .unwrap();
    assert_eq!(status["watching"], true);

    // Append a second entry; the watcher should pick it up after the
    // debounce window.
    let mut content = fs::read_to_string(&session_path).unwrap();
    content.push('\n');
    content.push_str(&user_line("u2", "a second entry appended later"));
    fs::write(&session_path, content).unwrap();

    let mut entries = 0;
    for _ in 0..100 {
        let stats = client::call(handle.socket_path(), "stats", json!({}), |_| {})
            .await
            .unwrap();
        entries = stats["entries"].as_i64().unwrap();
        if entries == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(entries, 2, "watcher did not re-ingest the changed session");

    handle.shutdown().await;
}
