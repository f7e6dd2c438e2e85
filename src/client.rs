//! Socket client for the indexer daemon.
//!
//! Thin wrapper used by the CLI subcommands: connect, send one request,
//! surface streamed progress through a callback, and return the terminal
//! response.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use tokio::io::BufReader;
use tokio::net::UnixStream;

use crate::protocol::{read_frame, write_frame, Frame, Request, Response};

/// Send `method` with `params` to the daemon at `socket_path`.
///
/// Every progress frame is handed to `on_progress` as it arrives. Returns
/// the terminal response's data, or an error carrying the daemon's message.
pub async fn call(
    socket_path: &Path,
    method: &str,
    params: Value,
    mut on_progress: impl FnMut(&Value),
) -> Result<Value> {
    let stream = UnixStream::connect(socket_path).await.with_context(|| {
        format!(
            "failed to connect to daemon at {} (is it running?)",
            socket_path.display()
        )
    })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_frame(
        &mut write_half,
        &Request {
            method: method.to_string(),
            params,
        },
    )
    .await?;

    loop {
        let line = match read_frame(&mut reader).await? {
            Some(line) => line,
            None => bail!("daemon closed the connection without a response"),
        };
        match crate::protocol::parse_frame(&line)? {
            Frame::Progress(data) => on_progress(&data),
            Frame::Final(Response {
                ok: true, data, ..
            }) => return Ok(data.unwrap_or(Value::Null)),
            Frame::Final(Response { error, .. }) => {
                bail!("{}", error.unwrap_or_else(|| "request failed".to_string()))
            }
        }
    }
}
