//! Client side of the chat stream.
//!
//! [`ChatView`] is the consumer state machine a front-end keeps per
//! conversation:
//!
//! ```text
//!            begin()                done
//!   Idle ───────────────▶ Streaming ──────▶ Idle
//!    ▲                      │  ▲ content
//!    │ begin()              │  └─┘
//!    │                      │ error / transport closed
//! Errored ◀─────────────────┘
//! ```
//!
//! While streaming, `content` deltas accumulate in a pending answer. A
//! `done` event finalizes that answer as an assistant turn with its sources
//! and fixes the conversation id for later requests. An `error` event, or a
//! transport that closes without any terminal event, leaves the view
//! `Errored` and the partial answer is discarded. Events that arrive after
//! a terminal event are ignored.
//!
//! [`ChatClient`] drives a view from a remote server's `POST /chat`.

use anyhow::{bail, Result};
use futures::{Stream, StreamExt};
use std::time::Duration;

use crate::models::{Role, Source};
use crate::orchestrator::ChatRequest;
use crate::stream::{FrameDecoder, StreamEvent};

/// Where the view is in its request cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    Idle,
    Streaming,
    Errored(String),
}

/// A finalized turn as the user sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayTurn {
    pub role: Role,
    pub content: String,
    pub sources: Vec<Source>,
}

#[derive(Debug)]
pub struct ChatView {
    state: ViewState,
    turns: Vec<DisplayTurn>,
    pending: String,
    conversation_id: Option<String>,
    scope: Vec<i64>,
}

impl Default for ChatView {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatView {
    pub fn new() -> Self {
        Self {
            state: ViewState::Idle,
            turns: Vec::new(),
            pending: String::new(),
            conversation_id: None,
            scope: Vec::new(),
        }
    }

    /// Continue an existing conversation.
    pub fn resume(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            ..Self::new()
        }
    }

    /// Restrict retrieval of later requests to these articles. Empty means
    /// the whole library.
    pub fn set_scope(&mut self, article_ids: Vec<i64>) {
        self.scope = article_ids;
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn turns(&self) -> &[DisplayTurn] {
        &self.turns
    }

    /// Answer text received so far for the in-flight request.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.state == ViewState::Streaming
    }

    /// Record the user's message and return the request to send for it.
    ///
    /// Fails while another request is still streaming.
    pub fn begin(&mut self, message: &str) -> Result<ChatRequest> {
        if self.is_streaming() {
            bail!("a request is already in flight");
        }

        // A failed request leaves its user turn unanswered; the server stored
        // nothing for it, so a retry takes its place.
        if self.turns.last().map(|t| t.role == Role::User).unwrap_or(false) {
            self.turns.pop();
        }

        self.turns.push(DisplayTurn {
            role: Role::User,
            content: message.to_string(),
            sources: Vec::new(),
        });
        self.pending.clear();
        self.state = ViewState::Streaming;

        Ok(ChatRequest {
            message: message.to_string(),
            conversation_id: self.conversation_id.clone(),
            article_ids: if self.scope.is_empty() {
                None
            } else {
                Some(self.scope.clone())
            },
        })
    }

    /// Apply one event. Returns true when the event ended the request.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        if !self.is_streaming() {
            tracing::debug!(?event, "ignoring event outside of a request");
            return false;
        }

        match event {
            StreamEvent::Content { content } => {
                self.pending.push_str(&content);
                false
            }
            StreamEvent::Done {
                conversation_id,
                sources,
            } => {
                match &self.conversation_id {
                    None => self.conversation_id = Some(conversation_id),
                    Some(known) if *known != conversation_id => {
                        tracing::warn!(
                            known = %known,
                            received = %conversation_id,
                            "server reported a different conversation id; keeping the first"
                        );
                    }
                    Some(_) => {}
                }
                self.turns.push(DisplayTurn {
                    role: Role::Assistant,
                    content: std::mem::take(&mut self.pending),
                    sources,
                });
                self.state = ViewState::Idle;
                true
            }
            StreamEvent::Error { error } => {
                self.fail(error);
                true
            }
        }
    }

    /// The transport closed. Without a terminal event the answer is
    /// incomplete, so this is an error.
    pub fn abort(&mut self) {
        if self.is_streaming() {
            self.fail("connection closed before the answer completed");
        }
    }

    /// Mark the in-flight request failed, discarding the partial answer.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.pending.clear();
        self.state = ViewState::Errored(message.into());
    }
}

/// Feed a raw `text/event-stream` body into `view`.
///
/// Stops reading at the first terminal event. `on_event` sees every event
/// the view accepted, in order.
pub async fn consume<S, B, E, F>(view: &mut ChatView, mut body: S, mut on_event: F)
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    F: FnMut(&StreamEvent),
{
    let mut decoder = FrameDecoder::new();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "chat stream interrupted");
                break;
            }
        };
        for event in decoder.push(bytes.as_ref()) {
            if !view.is_streaming() {
                return;
            }
            on_event(&event);
            if view.apply(event) {
                return;
            }
        }
    }

    view.abort();
}

// ============ HTTP client ============

/// Talks to a running `assist serve`.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Send `message` on behalf of `view` and stream the answer into it.
    ///
    /// Errors are returned only when the request could not be made or was
    /// rejected before streaming; in-band failures end with the view
    /// `Errored`.
    pub async fn send<F>(&self, view: &mut ChatView, message: &str, on_event: F) -> Result<()>
    where
        F: FnMut(&StreamEvent),
    {
        let request = view.begin(message)?;
        let url = format!("{}/chat", self.base_url);

        let response = match self.http.post(&url).json(&request).send().await {
            Ok(r) => r,
            Err(e) => {
                view.fail(e.to_string());
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("server returned {}", status));
            view.fail(message.clone());
            bail!("{}", message);
        }

        consume(view, response.bytes_stream(), on_event).await;
        Ok(())
    }
}
