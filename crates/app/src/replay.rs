//! Replay a captured response body through the stream parser.

use anyhow::{Context, Result};
use serde_json::Value;
use std::convert::Infallible;
use std::path::Path;

/// Split `body` into `chunk_size`-byte pieces and parse them as a stream,
/// calling `on_value` for each parsed value. Returns the value count.
pub async fn replay_bytes(body: &[u8], chunk_size: usize, on_value: impl FnMut(Value)) -> usize {
    let chunks = body.chunks(chunk_size.max(1)).map(Ok::<_, Infallible>);
    match streaming::read_json_stream(futures::stream::iter(chunks), on_value).await {
        Ok(count) => count,
        Err(never) => match never {},
    }
}

pub async fn replay_file(
    path: &Path,
    chunk_size: usize,
    on_value: impl FnMut(Value),
) -> Result<usize> {
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(replay_bytes(&body, chunk_size, on_value).await)
}
