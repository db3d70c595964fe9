//! Incremental parser for streamed AI provider responses.
//!
//! Providers stream one of two shapes:
//! - a single top-level JSON array of objects (`[{...},{...}]`), or
//! - line-oriented text: SSE (`data: {...}` lines separated by blank lines) or
//!   NDJSON (one JSON value per line).
//!
//! The shape is detected from the first non-whitespace character and stays
//! fixed until [`StreamParser::reset`]. Malformed input is skipped, never
//! reported: callers get whatever values could be recovered.

use serde_json::Value;
use tracing::{debug, trace, warn};

/// Detected wire shape of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    JsonArray,
    Lines,
}

#[derive(Debug, Default)]
enum ParserMode {
    #[default]
    Unknown,
    Array(ArrayState),
    Sse(SseState),
}

#[derive(Debug, Default)]
struct ArrayState {
    /// Parsed objects held back until the closing `]`
    pending: Vec<Value>,
    /// Set once `]` was seen; all further input is dropped
    ended: bool,
    /// Brace scan that ran out of input, resumed on the next chunk
    scan: Option<ObjectScan>,
}

#[derive(Debug, Default)]
struct SseState {
    /// Accumulated `data:` payloads of the current event
    data: String,
}

/// Progress of a brace-matching scan over the buffer. Offsets are byte
/// offsets into `StreamParser::buffer`.
#[derive(Debug, Clone, Copy)]
struct ObjectScan {
    start: usize,
    next: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

enum ScanResult {
    /// Offset of the `}` closing the object
    Complete(usize),
    Incomplete(ObjectScan),
}

impl ObjectScan {
    fn new(start: usize) -> Self {
        Self {
            start,
            next: start,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    fn resume(mut self, bytes: &[u8]) -> ScanResult {
        while self.next < bytes.len() {
            let b = bytes[self.next];
            self.next += 1;

            if self.in_string {
                // A quote closes the string only after an even run of backslashes
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return ScanResult::Complete(self.next - 1);
                    }
                }
                _ => {}
            }
        }
        ScanResult::Incomplete(self)
    }
}

/// Incremental parser that turns arbitrarily split text chunks into JSON values.
///
/// One instance handles one stream at a time; call [`reset`](Self::reset) (or
/// [`finish`](Self::finish)) before reusing it for the next response.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
    /// Start of the unconsumed part of `buffer`
    cursor: usize,
    mode: ParserMode,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of the stream. Returns the values completed by it,
    /// in stream order.
    pub fn process_chunk(&mut self, chunk: &str) -> Vec<Value> {
        if self.is_finished() {
            return Vec::new();
        }

        self.buffer.push_str(chunk);
        if matches!(self.mode, ParserMode::Unknown) && !self.detect_mode() {
            return Vec::new();
        }

        let mut out = Vec::new();
        match &mut self.mode {
            ParserMode::Array(state) => {
                scan_array(&self.buffer, &mut self.cursor, state, &mut out)
            }
            ParserMode::Sse(state) => {
                scan_lines(&self.buffer, &mut self.cursor, state, &mut out)
            }
            ParserMode::Unknown => {}
        }

        self.compact();
        out
    }

    /// Flush whatever the end of the stream left behind, then reset.
    ///
    /// Emits the held-back objects of an array that never saw its `]`, and
    /// parses a trailing line that had no newline.
    pub fn finish(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        match &mut self.mode {
            ParserMode::Array(state) => {
                if !state.ended {
                    out.append(&mut state.pending);
                }
            }
            ParserMode::Sse(state) => {
                let rest = &self.buffer[self.cursor..];
                if !rest.trim().is_empty() {
                    handle_line(rest, state, &mut out);
                }
            }
            ParserMode::Unknown => {}
        }
        self.reset();
        out
    }

    /// Return to the initial state so the instance can parse a new stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.mode = ParserMode::Unknown;
    }

    /// The detected stream shape, once any non-whitespace input was seen.
    pub fn format(&self) -> Option<StreamFormat> {
        match self.mode {
            ParserMode::Unknown => None,
            ParserMode::Array(_) => Some(StreamFormat::JsonArray),
            ParserMode::Sse(_) => Some(StreamFormat::Lines),
        }
    }

    /// True once a JSON array stream was closed. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        matches!(&self.mode, ParserMode::Array(state) if state.ended)
    }

    fn detect_mode(&mut self) -> bool {
        let rest = &self.buffer[self.cursor..];
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            return false;
        }

        if trimmed.starts_with('[') {
            self.cursor += rest.len() - trimmed.len() + 1;
            self.mode = ParserMode::Array(ArrayState::default());
            debug!("stream parser: JSON array stream");
        } else {
            self.mode = ParserMode::Sse(SseState::default());
            debug!("stream parser: SSE/NDJSON stream");
        }
        true
    }

    /// Drop the consumed prefix of the buffer.
    fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let consumed = self.cursor;
        self.buffer.drain(..consumed);
        self.cursor = 0;

        if let ParserMode::Array(ArrayState {
            scan: Some(scan), ..
        }) = &mut self.mode
        {
            scan.start -= consumed;
            scan.next -= consumed;
        }
    }
}

fn scan_array(buffer: &str, cursor: &mut usize, state: &mut ArrayState, out: &mut Vec<Value>) {
    let bytes = buffer.as_bytes();

    loop {
        let scan = match state.scan.take() {
            Some(scan) => scan,
            None => {
                while *cursor < bytes.len()
                    && (bytes[*cursor].is_ascii_whitespace() || bytes[*cursor] == b',')
                {
                    *cursor += 1;
                }
                if *cursor >= bytes.len() {
                    return;
                }

                match bytes[*cursor] {
                    b']' => {
                        state.ended = true;
                        out.append(&mut state.pending);
                        *cursor = bytes.len();
                        debug!("stream parser: array closed, {} values", out.len());
                        return;
                    }
                    b'{' => ObjectScan::new(*cursor),
                    _ => {
                        *cursor += char_len_at(buffer, *cursor);
                        continue;
                    }
                }
            }
        };

        match scan.resume(bytes) {
            ScanResult::Complete(end) => {
                match serde_json::from_str::<Value>(&buffer[scan.start..=end]) {
                    Ok(value) => {
                        state.pending.push(value);
                        *cursor = end + 1;
                    }
                    Err(err) => {
                        // Step past the opening brace and rescan from there
                        warn!("stream parser: skipping malformed array item: {}", err);
                        *cursor = scan.start + 1;
                    }
                }
            }
            ScanResult::Incomplete(scan) => {
                state.scan = Some(scan);
                return;
            }
        }
    }
}

fn scan_lines(buffer: &str, cursor: &mut usize, state: &mut SseState, out: &mut Vec<Value>) {
    let rest = &buffer[*cursor..];

    if !rest.contains('\n') {
        // Providers that send one bare JSON value per chunk with no delimiter
        let candidate = rest.trim();
        if !candidate.is_empty() && !candidate.starts_with("data:") {
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                out.push(value);
                *cursor = buffer.len();
            }
        }
        return;
    }

    while let Some(offset) = buffer[*cursor..].find('\n') {
        let line = &buffer[*cursor..*cursor + offset];
        *cursor += offset + 1;
        handle_line(line, state, out);
    }
}

fn handle_line(line: &str, state: &mut SseState, out: &mut Vec<Value>) {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.trim().is_empty() {
        if !state.data.is_empty() {
            match serde_json::from_str::<Value>(&state.data) {
                Ok(value) => out.push(value),
                Err(err) => warn!("stream parser: dropping unparseable SSE event: {}", err),
            }
            state.data.clear();
        }
        return;
    }

    if let Some(payload) = data_payload(line) {
        if payload.trim() == "[DONE]" {
            if !state.data.is_empty() {
                if let Ok(value) = serde_json::from_str::<Value>(&state.data) {
                    out.push(value);
                }
                state.data.clear();
            }
            trace!("stream parser: [DONE]");
            return;
        }

        if !state.data.is_empty() && starts_container(payload.trim_start()) {
            debug!(
                "stream parser: discarding {} bytes of unterminated SSE data",
                state.data.len()
            );
            state.data.clear();
        }
        state.data.push_str(payload);

        // Some providers split one value over many frames without blank lines
        if let Ok(value) = serde_json::from_str::<Value>(&state.data) {
            out.push(value);
            state.data.clear();
        }
        return;
    }

    match serde_json::from_str::<Value>(line.trim()) {
        Ok(value) => out.push(value),
        Err(_) => trace!("stream parser: skipping non-JSON line"),
    }
}

fn data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?;
    Some(payload.strip_prefix(' ').unwrap_or(payload))
}

fn starts_container(text: &str) -> bool {
    text.starts_with('{') || text.starts_with('[')
}

fn char_len_at(text: &str, offset: usize) -> usize {
    text[offset..].chars().next().map_or(1, char::len_utf8)
}
