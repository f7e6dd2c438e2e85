//! Socket wire protocol: newline-delimited JSON frames.
//!
//! One request per connection. The server emits zero or more progress
//! frames (`{"progress":true,"data":...}`) followed by exactly one terminal
//! frame (`{"ok":...,"data":...}` or `{"ok":false,"error":...}`), then
//! closes. Clients tell the two apart by probing the `progress` field.
//!
//! Frames are capped at 1 MiB; an oversize or malformed frame terminates
//! the connection with an error.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::index_db::IndexStats;
use crate::ingest::{EmbedProgress, IndexProgress};

/// Read-buffer cap per frame.
pub const MAX_FRAME_BYTES: u64 = 1024 * 1024;

/// A request as sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Terminal frame of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Non-terminal frame carrying opaque progress data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressFrame {
    pub progress: bool,
    pub data: Value,
}

impl ProgressFrame {
    pub fn new(data: Value) -> Self {
        Self {
            progress: true,
            data,
        }
    }
}

/// Any frame a client can receive.
#[derive(Debug, Clone)]
pub enum Frame {
    Progress(Value),
    Final(Response),
}

/// Classify a received line by probing the `progress` field.
pub fn parse_frame(line: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("progress").and_then(|p| p.as_bool()) == Some(true) {
        return Ok(Frame::Progress(
            value.get("data").cloned().unwrap_or(Value::Null),
        ));
    }
    Ok(Frame::Final(serde_json::from_value(value)?))
}

// ============ Method parameter / data shapes ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncData {
    pub projects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticSearchParams {
    pub query: String,
    #[serde(flatten)]
    pub options: crate::search::SemanticQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigReloadData {
    pub embedding_enabled: bool,
}

/// Daemon state as reported by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    /// `idle`, `syncing`, or `embedding`.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_progress: Option<IndexProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_progress: Option<EmbedProgress>,
    pub model: String,
    pub model_dim: usize,
    pub uptime_seconds: u64,
    pub watching: bool,
}

/// Aggregate counts as reported by `stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsData {
    #[serde(flatten)]
    pub index: IndexStats,
    pub embeddings: i64,
    pub embedding_model: String,
}

/// Discovery-file record for a running daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub pid: u32,
    pub socket_path: String,
    pub started_at: String,
}

// ============ Frame I/O ============

/// Read one newline-terminated frame, enforcing the size cap.
///
/// Returns `None` on a clean EOF before any byte of a frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_FRAME_BYTES + 1);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() as u64 > MAX_FRAME_BYTES {
        bail!("frame exceeds {} byte cap", MAX_FRAME_BYTES);
    }
    let line = String::from_utf8(buf)?;
    Ok(Some(line.trim_end_matches('\n').to_string()))
}

/// Serialize `value` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
