use crate::constants::{DATA_PREFIX, DONE_TOKEN, MAX_PENDING_LINE_BYTES};
use crate::types::{OnelineError, Result};
use serde::Deserialize;

/// Incremental UTF-8 decoder. An incomplete trailing sequence is held until the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(
                        &self.pending[start..start + valid],
                    ));
                    match e.error_len() {
                        // Genuinely invalid bytes, not a split sequence.
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += valid + len;
                        }
                        None => {
                            start += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Flushes whatever is still held. Only a stream truncated mid-character yields U+FFFD here.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Splits decoded text into lines, holding the unterminated tail.
#[derive(Debug, Default)]
pub struct SseFramer {
    pending: String,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> Result<Vec<String>> {
        self.pending.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            return Err(OnelineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "upstream line exceeded {} bytes without a terminator",
                    MAX_PENDING_LINE_BYTES
                ),
            ))
            .into());
        }
        Ok(lines)
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim_end_matches('\r');
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// Result of decoding one upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Incremental content extracted from a JSON payload.
    Content(String),
    /// Payload that was not JSON, relayed as-is.
    Literal(String),
    /// In-band failure reported by the upstream.
    Error(String),
    Done,
    Ignored,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkContent>,
    #[serde(default)]
    message: Option<ChunkContent>,
}

#[derive(Debug, Deserialize)]
struct ChunkContent {
    #[serde(default)]
    content: Option<String>,
}

pub fn parse_upstream_line(line: &str) -> LineEvent {
    let Some(data) = line.trim_start().strip_prefix(DATA_PREFIX) else {
        return LineEvent::Ignored;
    };
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim().is_empty() {
        return LineEvent::Ignored;
    }
    if data.trim() == DONE_TOKEN {
        return LineEvent::Done;
    }
    parse_payload(data)
}

fn parse_payload(data: &str) -> LineEvent {
    match serde_json::from_str::<UpstreamChunk>(data) {
        Ok(chunk) => {
            if let Some(err) = chunk.error {
                return LineEvent::Error(error_message(&err));
            }
            match extract_content(&chunk) {
                Some(content) if !content.is_empty() => LineEvent::Content(content.to_string()),
                _ => LineEvent::Ignored,
            }
        }
        Err(_) => {
            tracing::debug!(
                "[☁️  -> ⚙️ ] Non-JSON data line relayed literally: {}",
                crate::str_utils::log_snippet(data, 120)
            );
            LineEvent::Literal(data.to_string())
        }
    }
}

fn extract_content(chunk: &UpstreamChunk) -> Option<&str> {
    let choice = chunk.choices.first()?;
    choice
        .delta
        .as_ref()
        .and_then(|d| d.content.as_deref())
        .or_else(|| choice.message.as_ref().and_then(|m| m.content.as_deref()))
}

fn error_message(err: &serde_json::Value) -> String {
    match err {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => match map.get("message") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => err.to_string(),
        },
        other => other.to_string(),
    }
}

/// Bytes in, decoded upstream lines out.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    framer: SseFramer,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<LineEvent>> {
        let text = self.utf8.decode(chunk);
        let lines = self.framer.push(&text)?;
        Ok(lines.iter().map(|l| parse_upstream_line(l)).collect())
    }

    pub fn finish(&mut self) -> Result<Vec<LineEvent>> {
        if self.utf8.has_pending() {
            tracing::warn!("[☁️  -> ⚙️ ] Upstream stream ended inside a multi-byte character");
        }
        let tail = self.utf8.finish();
        let mut lines = self.framer.push(&tail)?;
        lines.extend(self.framer.finish());
        Ok(lines.iter().map(|l| parse_upstream_line(l)).collect())
    }
}

/// Content of a buffered (non-streaming) upstream response body.
pub fn completion_content(body: &serde_json::Value) -> Option<&str> {
    let choice = body.get("choices")?.get(0)?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| choice.get("delta").and_then(|d| d.get("content")))
        .and_then(|c| c.as_str())
}
