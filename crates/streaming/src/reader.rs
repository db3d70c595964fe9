//! Drive HTTP response bodies through the stream parser.

use anyhow::{anyhow, Result};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::decoder::Utf8ChunkDecoder;
use crate::parser::StreamParser;

/// Feed a byte stream through UTF-8 decoding and the stream parser, handing
/// each parsed value to `on_value` as soon as it is complete.
///
/// Returns the number of values produced. Stops at the first transport error.
pub async fn read_json_stream<S, B, E, F>(stream: S, mut on_value: F) -> Result<usize, E>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    F: FnMut(Value),
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = Utf8ChunkDecoder::new();
    let mut parser = StreamParser::new();
    let mut count = 0;

    while let Some(chunk) = stream.next().await {
        let text = decoder.decode(chunk?.as_ref());
        for value in parser.process_chunk(&text) {
            count += 1;
            on_value(value);
        }
    }

    let tail = decoder.finish();
    let mut rest = parser.process_chunk(&tail);
    rest.extend(parser.finish());
    for value in rest {
        count += 1;
        on_value(value);
    }

    debug!("stream finished with {} values", count);
    Ok(count)
}

/// Consume a streaming provider response, forwarding parsed values to `tx`.
pub async fn read_response(resp: reqwest::Response, tx: &UnboundedSender<Value>) -> Result<usize> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let detail: String = body.chars().take(800).collect();
        if detail.trim().is_empty() {
            return Err(anyhow!("stream error: {}", status));
        }
        return Err(anyhow!("stream error: {}\n{}", status, detail));
    }

    read_json_stream(resp.bytes_stream(), |value| {
        // Receiver may have dropped
        let _ = tx.send(value);
    })
    .await
    .map_err(|e| anyhow!("stream read error: {}", e))
}
