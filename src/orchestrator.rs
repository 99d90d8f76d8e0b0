//! Chat orchestrator: the per-message coordinator.
//!
//! For each incoming message the orchestrator:
//!
//! 1. validates the request and resolves its conversation (synchronously,
//!    before any stream exists; see [`Orchestrator::prepare`]),
//! 2. retrieves article fragments, failing open to an empty context,
//! 3. builds the prompt from instructions, fragments, history, and message,
//! 4. forwards every generated delta as a `content` event the moment it
//!    arrives,
//! 5. persists the user/assistant turn pair and emits a terminal `done`, or
//!    emits a terminal `error` and persists nothing.
//!
//! Each request runs in its own task and talks to the caller over a bounded
//! channel. The channel is closed only after the terminal event, and no
//! event ever follows it. If the caller drops the receiver, the task stops
//! at its next suspension point, drops the generation stream (aborting the
//! upstream request), and writes nothing.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::{Config, UnknownConversation};
use crate::conversation::{ConversationStore, SqliteConversationStore};
use crate::error::ChatError;
use crate::generation::{create_generator, Generator};
use crate::models::{Fragment, NewTurn, Source};
use crate::prompt::{build_prompt, sources_of};
use crate::retrieval::{Retriever, SqliteRetriever};
use crate::stream::StreamEvent;

/// Capacity of the per-request event channel.
const EVENT_BUFFER: usize = 32;

/// Longest accepted conversation id.
const MAX_CONVERSATION_ID_LEN: usize = 128;

/// Inbound chat message, as posted by the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_ids: Option<Vec<i64>>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn in_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn scoped_to(mut self, ids: Vec<i64>) -> Self {
        self.article_ids = Some(ids);
        self
    }
}

/// A validated request whose conversation has been resolved.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub message: String,
    /// Id to append to; `None` means a new id is minted on success.
    pub conversation_id: Option<String>,
    /// Whether prior turns exist for `conversation_id`.
    pub has_history: bool,
    pub scope: Option<Vec<i64>>,
}

/// Orchestrator tunables, usually taken from `[chat]` and `[retrieval]`.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub system_prompt: String,
    pub max_message_chars: usize,
    pub max_scope_ids: usize,
    pub unknown_conversation: UnknownConversation,
    pub retrieval_timeout: Duration,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.chat.system_prompt.clone(),
            max_message_chars: config.chat.max_message_chars,
            max_scope_ids: config.chat.max_scope_ids,
            unknown_conversation: config.chat.unknown_conversation,
            retrieval_timeout: Duration::from_secs(config.retrieval.timeout_secs),
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from_config(&Config::with_db_path("assist.sqlite"))
    }
}

enum Outcome {
    Completed(StreamEvent),
    Cancelled,
}

/// Coordinates retrieval, generation, and persistence for chat messages.
#[derive(Clone)]
pub struct Orchestrator {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn ConversationStore>,
    settings: Arc<ChatSettings>,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn ConversationStore>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            retriever,
            generator,
            store,
            settings: Arc::new(settings),
        }
    }

    /// Wire the SQLite retriever and store with the configured generator.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        Ok(Self::new(
            Arc::new(SqliteRetriever::new(pool.clone(), config.retrieval.clone())),
            create_generator(&config.generation)?,
            Arc::new(SqliteConversationStore::new(pool)),
            ChatSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Validate and resolve, then start streaming.
    ///
    /// Errors are returned before any event is produced; once this returns
    /// `Ok`, the receiver yields zero or more `content` events followed by
    /// exactly one terminal event.
    pub async fn handle(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ChatError> {
        let prepared = self.prepare(request).await?;
        Ok(self.start(prepared))
    }

    /// Reject malformed requests and resolve the conversation id.
    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedRequest, ChatError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(ChatError::MalformedRequest(
                "message must not be empty".to_string(),
            ));
        }
        if message.chars().count() > self.settings.max_message_chars {
            return Err(ChatError::MalformedRequest(format!(
                "message exceeds maximum length of {} characters",
                self.settings.max_message_chars
            )));
        }

        let scope = self.validate_scope(request.article_ids)?;

        let requested_id = request
            .conversation_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let (conversation_id, has_history) = match requested_id {
            None => (None, false),
            Some(id) => {
                if id.len() > MAX_CONVERSATION_ID_LEN {
                    return Err(ChatError::MalformedRequest(format!(
                        "conversationId exceeds {} bytes",
                        MAX_CONVERSATION_ID_LEN
                    )));
                }
                let existing = self
                    .store
                    .get(&id)
                    .await
                    .map_err(|e| ChatError::Storage(e.to_string()))?;
                match (existing, self.settings.unknown_conversation) {
                    (Some(_), _) => (Some(id), true),
                    (None, UnknownConversation::Adopt) => (Some(id), false),
                    (None, UnknownConversation::Reject) => {
                        return Err(ChatError::ConversationNotFound(id))
                    }
                }
            }
        };

        Ok(PreparedRequest {
            message: message.to_string(),
            conversation_id,
            has_history,
            scope,
        })
    }

    fn validate_scope(&self, ids: Option<Vec<i64>>) -> Result<Option<Vec<i64>>, ChatError> {
        let mut ids = match ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => return Ok(None),
        };

        if let Some(bad) = ids.iter().find(|id| **id <= 0) {
            return Err(ChatError::MalformedRequest(format!(
                "invalid article id: {}",
                bad
            )));
        }

        ids.sort_unstable();
        ids.dedup();
        if ids.len() > self.settings.max_scope_ids {
            return Err(ChatError::MalformedRequest(format!(
                "articleIds may name at most {} articles",
                self.settings.max_scope_ids
            )));
        }
        Ok(Some(ids))
    }

    /// Spawn the request task and return its event receiver.
    pub fn start(&self, request: PreparedRequest) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = tracing::info_span!(
            "chat",
            conversation = request.conversation_id.as_deref().unwrap_or("new"),
            scope = request.scope.as_ref().map(|s| s.len()).unwrap_or(0),
        );
        let this = self.clone();
        tokio::spawn(async move { this.run(request, tx).await }.instrument(span));
        rx
    }

    async fn run(&self, request: PreparedRequest, tx: mpsc::Sender<StreamEvent>) {
        tracing::info!("chat request started");

        match self.drive(&request, &tx).await {
            Ok(Outcome::Completed(done)) => {
                if tx.send(done).await.is_err() {
                    tracing::info!("client disconnected before completion was delivered");
                }
            }
            Ok(Outcome::Cancelled) => {
                tracing::info!("client disconnected; request abandoned");
            }
            Err(err) => {
                tracing::warn!(error = %err, "chat request failed");
                let _ = tx.send(StreamEvent::error(err.to_string())).await;
            }
        }
    }

    async fn drive(
        &self,
        request: &PreparedRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<Outcome, ChatError> {
        let fragments = self.retrieve(request).await;
        let sources: Vec<Source> = sources_of(&fragments);

        let history = match (&request.conversation_id, request.has_history) {
            (Some(id), true) => self.store.read_history(id).await.map_err(|e| {
                ChatError::Persistence(format!("could not load conversation history: {}", e))
            })?,
            _ => Vec::new(),
        };

        let prompt = build_prompt(
            &self.settings.system_prompt,
            &fragments,
            &history,
            &request.message,
        );

        let mut deltas = tokio::select! {
            _ = tx.closed() => return Ok(Outcome::Cancelled),
            started = self.generator.generate(&prompt) => {
                started.map_err(|e| ChatError::Generation(e.to_string()))?
            }
        };

        let mut answer = String::new();
        loop {
            tokio::select! {
                biased;
                _ = tx.closed() => return Ok(Outcome::Cancelled),
                next = deltas.next() => match next {
                    Some(Ok(delta)) => {
                        answer.push_str(&delta);
                        if tx.send(StreamEvent::content(delta)).await.is_err() {
                            return Ok(Outcome::Cancelled);
                        }
                    }
                    Some(Err(e)) => return Err(ChatError::Generation(e.to_string())),
                    None => break,
                },
            }
        }
        drop(deltas);

        if answer.trim().is_empty() {
            return Err(ChatError::Generation(
                "model returned an empty answer".to_string(),
            ));
        }
        if tx.is_closed() {
            return Ok(Outcome::Cancelled);
        }

        let turns = [
            NewTurn::user(request.message.clone()),
            NewTurn::assistant(answer, sources.clone()),
        ];
        let conversation_id = self
            .store
            .create_or_append(request.conversation_id.as_deref(), &turns)
            .await
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        tracing::debug!(conversation = %conversation_id, "turn pair saved");

        Ok(Outcome::Completed(StreamEvent::Done {
            conversation_id,
            sources,
        }))
    }

    /// Retrieval never fails the request: errors and timeouts degrade to an
    /// empty context.
    async fn retrieve(&self, request: &PreparedRequest) -> Vec<Fragment> {
        let search = self
            .retriever
            .search(&request.message, request.scope.as_deref());
        match tokio::time::timeout(self.settings.retrieval_timeout, search).await {
            Ok(Ok(fragments)) => {
                tracing::debug!(fragments = fragments.len(), "retrieval finished");
                fragments
            }
            Ok(Err(e)) => {
                let err = ChatError::RetrievalUnavailable(e.to_string());
                tracing::warn!(error = %err, "continuing without context");
                Vec::new()
            }
            Err(_) => {
                let err = ChatError::RetrievalUnavailable("timed out".to_string());
                tracing::warn!(error = %err, "continuing without context");
                Vec::new()
            }
        }
    }
}
