//! Stream transport: StreamEvent framing for incremental delivery.
//!
//! Each [`StreamEvent`] is written as one Server-Sent-Events style frame:
//!
//! ```text
//! data: {"type":"content","content":"Pric"}
//!
//! data: {"type":"done","conversationId":"…","sources":[{"id":42,"title":"…","url":"…"}]}
//!
//! ```
//!
//! Frames are self-delimited by the blank line, so a decoder can interpret
//! each one as soon as it is complete regardless of how the bytes were
//! chunked by the network. The terminal frame (`done` or `error`) is
//! recognised by its `type`; transport closure carries no meaning of its
//! own.

use axum::response::sse::Event;
use serde::{Deserialize, Serialize};

use crate::models::Source;

/// One frame of the orchestrator's output protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// A text delta of the answer being generated.
    Content { content: String },
    /// Terminal success: the turn pair was saved.
    Done {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        sources: Vec<Source>,
    },
    /// Terminal failure: the answer must not be treated as complete.
    Error { error: String },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Content {
            content: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Content { .. })
    }
}

/// Wrap an event as an SSE `data:` event for the axum [`Sse`] response.
///
/// [`Sse`]: axum::response::sse::Sse
pub fn sse_event(event: &StreamEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to encode stream event");
        Event::default().data(
            serde_json::json!({
                "type": "error",
                "error": format!("failed to encode event: {}", e),
            })
            .to_string(),
        )
    })
}

/// Encode one event as the complete `data:` frame the server writes.
#[cfg(test)]
pub(crate) fn encode_frame(event: &StreamEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_default();
    format!("data: {}\n\n", json)
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode correctly. Returns the `data`
/// payload of every event completed by the pushed bytes; comment lines and
/// fields other than `data` are ignored. An event that is never terminated
/// by a blank line is never returned.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        self.buf.drain(..start);

        payloads
    }

    /// True when bytes of an unfinished event are still buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || !self.data_lines.is_empty()
    }
}

/// Client-side frame decoder turning raw bytes back into [`StreamEvent`]s.
///
/// Unknown or malformed frames are dropped without affecting the frames
/// around them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    sse: SseBuffer,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.sse
            .push(bytes)
            .into_iter()
            .filter_map(|data| match serde_json::from_str::<StreamEvent>(&data) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed frame");
                    None
                }
            })
            .collect()
    }
}
