//! Unix-socket RPC server.
//!
//! Listens on `<config_dir>/indexer.sock` and speaks the newline-delimited
//! JSON protocol of [`crate::protocol`]: one request per connection, zero
//! or more progress frames, one terminal frame, close.
//!
//! `sync` is the only streaming method: the handler subscribes to the
//! in-flight sync's fan-out and forwards frames as they arrive, then writes
//! the shared final response. Every other method is single-shot. Handler
//! panics are caught at the dispatcher (task join) and surface as error
//! frames; the daemon itself is unaffected.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::daemon::Daemon;
use crate::protocol::{
    read_frame, write_frame, ProgressFrame, Request, Response, SemanticSearchParams, SyncParams,
};
use crate::search::LiteralQuery;

pub struct RpcServer {
    accept_task: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RpcServer {
    /// Bind the socket (removing a stale one first) and start accepting.
    pub async fn start(daemon: Arc<Daemon>, socket_path: PathBuf) -> Result<RpcServer> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;

        let cancel = daemon.shutdown.child_token();
        let accept_cancel = cancel.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    },
                };
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(daemon, stream).await {
                        debug!(error = %e, "connection ended with error");
                    }
                });
            }
        });

        Ok(RpcServer {
            accept_task: Some(accept_task),
            cancel,
        })
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let line = match read_frame(&mut reader).await {
        Ok(Some(line)) => line,
        Ok(None) => return Ok(()),
        Err(e) => {
            write_frame(&mut writer, &Response::err(e.to_string())).await?;
            return Ok(());
        }
    };

    let request: Request = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            write_frame(&mut writer, &Response::err(format!("malformed request: {}", e)))
                .await?;
            return Ok(());
        }
    };

    debug!(method = %request.method, "request");

    if request.method == "sync" {
        return handle_sync(daemon, request.params, &mut writer).await;
    }

    // Single-shot dispatch in its own task: a panic becomes an error frame.
    let handler = tokio::spawn(dispatch(daemon, request.method, request.params));
    let response = match handler.await {
        Ok(Ok(data)) => Response::ok(data),
        Ok(Err(e)) => Response::err(e.to_string()),
        Err(e) => Response::err(format!("internal error: {}", e)),
    };
    write_frame(&mut writer, &response).await
}

/// Drive a sync while forwarding its progress stream to the connection.
async fn handle_sync<W>(daemon: Arc<Daemon>, params: Value, writer: &mut W) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let params: SyncParams = serde_json::from_value(params).unwrap_or_default();

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let sync_daemon = Arc::clone(&daemon);
    let mut sync = Box::pin(async move { sync_daemon.run_or_join_sync(params.force, Some(tx)).await });

    loop {
        tokio::select! {
            // Progress first, so frames keep their generation order.
            biased;
            frame = rx.recv() => {
                if let Some(data) = frame {
                    write_frame(writer, &ProgressFrame::new(data)).await?;
                }
            }
            result = &mut sync => {
                // Flush anything the fan-out queued before completion.
                while let Ok(data) = rx.try_recv() {
                    write_frame(writer, &ProgressFrame::new(data)).await?;
                }
                let response = match result {
                    Ok(data) => Response::ok(serde_json::to_value(data)?),
                    Err(e) => Response::err(e.to_string()),
                };
                write_frame(writer, &response).await?;
                return Ok(());
            }
        }
    }
}

async fn dispatch(daemon: Arc<Daemon>, method: String, params: Value) -> Result<Value> {
    match method.as_str() {
        "search" => {
            let query: LiteralQuery = serde_json::from_value(params)?;
            let results = daemon.literal_search(&query).await?;
            Ok(json!({
                "results": results.sessions,
                "total_matches": results.total_matches,
            }))
        }
        "semantic_search" => {
            let params: SemanticSearchParams = serde_json::from_value(params)?;
            let results = daemon.semantic_search(&params.query, &params.options).await?;
            Ok(json!({ "results": results }))
        }
        "stats" => Ok(serde_json::to_value(daemon.stats().await?)?),
        "status" => Ok(serde_json::to_value(daemon.status())?),
        "config_reload" => Ok(serde_json::to_value(daemon.config_reload().await?)?),
        _ => anyhow::bail!("unknown method"),
    }
}
