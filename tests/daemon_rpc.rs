//! End-to-end tests over the socket protocol: literal search, semantic
//! search, stats, protocol errors, and config reload.

mod common;

use common::{start_daemon, sync_and_wait, user_line, write_config, write_session};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use recall::client;
use recall::protocol::{read_frame, Frame};

#[tokio::test]
async fn test_literal_search_substring_and_case() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    write_session(
        &store_root,
        "proj",
        "s1",
        &[
            r#"{"role":"user","text":"Debugging AUTH timeouts"}"#.to_string(),
            r#"{"role":"assistant","text":"auth works"}"#.to_string(),
        ],
    );
    write_config(tmp.path(), &store_root, false);

    let handle = start_daemon(tmp.path()).await;
    sync_and_wait(&handle).await;

    // Case-insensitive: both lines match.
    let data = client::call(
        handle.socket_path(),
        "search",
        json!({"query": "auth", "limit": 10}),
        |_| {},
    )
    .await
    .unwrap();
    assert_eq!(data["total_matches"], 2);
    let matches = data["results"][0]["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0]["line_num"], 1);
    assert_eq!(matches[1]["line_num"], 2);
    assert!(matches[0]["preview"].as_str().unwrap().contains("AUTH"));
    assert_eq!(matches[0]["role"], "user");
    assert_eq!(matches[1]["role"], "assistant");

    // Case-sensitive: only the uppercase line matches.
    let data = client::call(
        handle.socket_path(),
        "search",
        json!({"query": "AUTH", "limit": 10, "case_sensitive": true}),
        |_| {},
    )
    .await
    .unwrap();
    assert_eq!(data["total_matches"], 1);
    assert_eq!(data["results"][0]["matches"][0]["line_num"], 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_literal_search_limits() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    for s in 0..5 {
        let lines: Vec<String> = (0..4)
            .map(|i| user_line(&format!("u{}-{}", s, i), &format!("needle number {}", i)))
            .collect();
        write_session(&store_root, "proj", &format!("s{}", s), &lines);
    }
    write_config(tmp.path(), &store_root, false);

    let handle = start_daemon(tmp.path()).await;
    sync_and_wait(&handle).await;

    let data = client::call(
        handle.socket_path(),
        "search",
        json!({"query": "needle", "limit": 6, "limit_per_session": 2}),
        |_| {},
    )
    .await
    .unwrap();

    assert_eq!(data["total_matches"], 6);
    let sessions = data["results"].as_array().unwrap();
    assert_eq!(sessions.len(), 3);
    for session in sessions {
        assert_eq!(session["matches"].as_array().unwrap().len(), 2);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_literal_search_invalid_regex() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    write_config(tmp.path(), &store_root, false);

    let handle = start_daemon(tmp.path()).await;

    let result = client::call(
        handle.socket_path(),
        "search",
        json!({"query": "(unclosed", "use_regex": true}),
        |_| {},
    )
    .await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("invalid search pattern"), "got: {}", err);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_semantic_search_project_filter() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    write_session(
        &store_root,
        "alpha",
        "s1",
        &[user_line("u1", "kubernetes deployment strategies and rollback plans")],
    );
    write_session(
        &store_root,
        "beta",
        "s2",
        &[user_line("u2", "favorite pasta recipes from northern italy")],
    );
    write_config(tmp.path(), &store_root, true);

    let handle = start_daemon(tmp.path()).await;
    sync_and_wait(&handle).await;

    let data = client::call(
        handle.socket_path(),
        "semantic_search",
        json!({"query": "kubernetes rollback", "filter_project": "alph", "limit": 10}),
        |_| {},
    )
    .await
    .unwrap();

    let results = data["results"].as_array().unwrap();
    assert!(!results.is_empty());
    for hit in results {
        assert_eq!(hit["session_id"], "s1");
        assert_eq!(hit["project_name"], "alpha");
    }

    // A filter matching nothing yields an empty result, not an error.
    let data = client::call(
        handle.socket_path(),
        "semantic_search",
        json!({"query": "anything", "filter_project": "zzz", "limit": 10}),
        |_| {},
    )
    .await
    .unwrap();
    assert!(data["results"].as_array().unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_semantic_search_diversity_spans_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");

    // The hash embedder maps identical text to identical vectors, so five
    // entries sharing one text give five same-direction embeddings: three
    // in s1, one each in s2 and s3.
    let text = "rotating the api keys for the staging cluster";
    write_session(
        &store_root,
        "proj",
        "s1",
        &[
            user_line("u1", text),
            user_line("u2", text),
            user_line("u3", text),
        ],
    );
    write_session(&store_root, "proj", "s2", &[user_line("u4", text)]);
    write_session(&store_root, "proj", "s3", &[user_line("u5", text)]);
    write_config(tmp.path(), &store_root, true);

    let handle = start_daemon(tmp.path()).await;
    sync_and_wait(&handle).await;

    // Without diversity, the three equidistant s1 chunks can crowd out the
    // other sessions; with it, the triple spans three distinct sessions.
    let data = client::call(
        handle.socket_path(),
        "semantic_search",
        json!({"query": text, "limit": 3, "diversity": true}),
        |_| {},
    )
    .await
    .unwrap();

    let results = data["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    let sessions: std::collections::HashSet<&str> = results
        .iter()
        .map(|hit| hit["session_id"].as_str().unwrap())
        .collect();
    assert_eq!(sessions.len(), 3, "results: {:?}", results);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_stats_reports_counts() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    write_session(
        &store_root,
        "proj",
        "s1",
        &[
            user_line("u1", "first prompt about databases"),
            user_line("u2", "second prompt about indexes"),
        ],
    );
    write_config(tmp.path(), &store_root, true);

    let handle = start_daemon(tmp.path()).await;
    sync_and_wait(&handle).await;

    let data = client::call(handle.socket_path(), "stats", json!({}), |_| {})
        .await
        .unwrap();
    assert_eq!(data["projects"], 1);
    assert_eq!(data["sessions"], 1);
    assert_eq!(data["entries"], 2);
    assert_eq!(data["synced_files"], 1);
    assert!(data["embeddings"].as_i64().unwrap() > 0);
    assert_eq!(data["embedding_model"], "hash-16");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_method_and_malformed_request() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    write_config(tmp.path(), &store_root, false);
    let handle = start_daemon(tmp.path()).await;

    // Unknown method gets the canonical error message.
    let stream = UnixStream::connect(handle.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_half
        .write_all(b"{\"method\":\"bogus\"}\n")
        .await
        .unwrap();
    let line = read_frame(&mut reader).await.unwrap().unwrap();
    match recall::protocol::parse_frame(&line).unwrap() {
        Frame::Final(resp) => {
            assert!(!resp.ok);
            assert_eq!(resp.error.as_deref(), Some("unknown method"));
        }
        _ => panic!("expected final frame"),
    }

    // Malformed JSON gets a terminal error, then the connection closes.
    let stream = UnixStream::connect(handle.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_half.write_all(b"this is not json\n").await.unwrap();
    let line = read_frame(&mut reader).await.unwrap().unwrap();
    match recall::protocol::parse_frame(&line).unwrap() {
        Frame::Final(resp) => {
            assert!(!resp.ok);
            assert!(resp.error.unwrap().contains("malformed request"));
        }
        _ => panic!("expected final frame"),
    }
    assert!(read_frame(&mut reader).await.unwrap().is_none());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_config_reload_enables_embedding() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    write_session(
        &store_root,
        "proj",
        "s1",
        &[user_line("u1", "a reasonably long prompt about embeddings")],
    );
    write_config(tmp.path(), &store_root, false);

    let handle = start_daemon(tmp.path()).await;
    sync_and_wait(&handle).await;

    // Disabled: no model, semantic search refuses.
    let status = client::call(handle.socket_path(), "status", json!({}), |_| {})
        .await
        .unwrap();
    assert_eq!(status["model"], "");
    assert_eq!(status["model_dim"], 0);
    let err = client::call(
        handle.socket_path(),
        "semantic_search",
        json!({"query": "anything"}),
        |_| {},
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not enabled"));

    // Flip the config on disk and reload.
    write_config(tmp.path(), &store_root, true);
    let data = client::call(handle.socket_path(), "config_reload", json!({}), |_| {})
        .await
        .unwrap();
    assert_eq!(data["embedding_enabled"], true);

    let status = client::call(handle.socket_path(), "status", json!({}), |_| {})
        .await
        .unwrap();
    assert_eq!(status["model"], "hash-16");
    assert_eq!(status["model_dim"], 16);

    // The background sync embeds existing sessions.
    let mut embeddings = 0;
    for _ in 0..50 {
        let stats = client::call(handle.socket_path(), "stats", json!({}), |_| {})
            .await
            .unwrap();
        embeddings = stats["embeddings"].as_i64().unwrap();
        if embeddings > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(embeddings > 0, "no embeddings appeared after reload");

    // Reloading again with no change is a noop acknowledgement.
    let data = client::call(handle.socket_path(), "config_reload", json!({}), |_| {})
        .await
        .unwrap();
    assert_eq!(data["embedding_enabled"], true);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_second_daemon_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let store_root = tmp.path().join("store");
    write_config(tmp.path(), &store_root, false);

    let handle = start_daemon(tmp.path()).await;

    let mut options = recall::daemon::DaemonOptions::new(tmp.path().to_path_buf());
    options.watch = false;
    let err = recall::daemon::launch(options).await.unwrap_err();
    assert!(err.to_string().contains("already running"), "got: {}", err);

    handle.shutdown().await;

    // After a clean shutdown the instance file is gone and a new daemon
    // can take over.
    assert!(!tmp.path().join("instance.json").exists());
    let handle = start_daemon(tmp.path()).await;
    handle.shutdown().await;
}
