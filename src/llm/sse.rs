//! Incremental parser for `text/event-stream` chat-completion responses.
//!
//! Parsing is strictly line-buffered: raw bytes accumulate in an internal
//! buffer and are drained one complete line at a time, so a multi-byte UTF-8
//! sequence split across network chunks is reassembled before decoding. Only
//! lines prefixed `data:` carry payload; a literal `[DONE]` payload is
//! ignored; a line whose JSON does not parse is skipped without aborting the
//! stream. Any unterminated trailing buffer is flushed through the same path
//! at stream end.

use serde::Deserialize;

/// Stream chunk body, OpenAI-ish: `{"model": ..., "choices":[{"delta":{"content":"..."}}]}`
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    /// Some backends put the increment in `text` instead of `delta.content`
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Line-buffered event-stream parser yielding token deltas.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    model: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Model id reported by the stream so far, if any chunk carried one.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Feed raw bytes; returns every token delta completed by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some(idx) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(delta) = self.parse_line(line.trim_end_matches(['\n', '\r'])) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush the unterminated tail at stream end.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        let tail = String::from_utf8_lossy(&tail);
        self.parse_line(tail.trim_end_matches(['\n', '\r']))
    }

    fn parse_line(&mut self, line: &str) -> Option<String> {
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::trace!(error = %e, "skipping malformed stream line");
                return None;
            }
        };
        if let Some(model) = chunk.model {
            self.model = Some(model);
        }
        let choice = chunk.choices.into_iter().next()?;
        let delta = choice
            .delta
            .and_then(|d| d.content)
            .or(choice.text)
            .filter(|s| !s.is_empty())?;
        Some(delta)
    }
}
