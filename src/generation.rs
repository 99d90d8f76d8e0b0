//! Generation client abstraction and implementations.
//!
//! Defines the [`Generator`] trait and concrete implementations:
//! - **[`DisabledGenerator`]**: rejects every prompt; used when no provider
//!   is configured.
//! - **[`OpenAIGenerator`]**: streams from any OpenAI-compatible
//!   `POST /chat/completions` endpoint.
//!
//! A generator returns a [`DeltaStream`]: a stream of text deltas that ends
//! with `None` on success, or yields a single `Err` and then ends on
//! failure. Dropping the stream aborts the upstream request.
//!
//! # Retry Strategy
//!
//! Only the initial request is retried; once bytes have been streamed the
//! answer cannot be replayed.
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::prompt::Prompt;
use crate::stream::SseBuffer;

/// Incremental generation output.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Capability to turn a prompt into a stream of text deltas.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Start generating. An `Err` here means the prompt was rejected before
    /// any output was produced.
    async fn generate(&self, prompt: &Prompt) -> Result<DeltaStream>;
}

// ============ Disabled Generator ============

/// Used when `generation.provider = "disabled"`. Every request fails with a
/// descriptive error.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<DeltaStream> {
        bail!("generation provider is disabled; set [generation] provider in config")
    }
}

// ============ OpenAI Generator ============

/// Streaming chat-completions client.
///
/// Reads `OPENAI_API_KEY` from the environment. The key is mandatory for
/// the default `api.openai.com` endpoint and optional for self-hosted
/// compatible servers.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
    max_retries: u32,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.base_url.contains("api.openai.com") {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        // The body streams for as long as the model writes, so only the gap
        // between chunks is bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    async fn open_stream(&self, prompt: &Prompt) -> Result<reqwest::Response> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": prompt.messages,
            "temperature": self.temperature,
            "stream": true,
        });
        let url = format!("{}/chat/completions", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&url).json(&body);
            if let Some(ref key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "generation request failed, retrying");
                        last_err = Some(anyhow!("generation API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("generation API error {}: {}", status, body_text);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "generation request failed, retrying");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("generation failed after retries")))
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<DeltaStream> {
        let response = self.open_stream(prompt).await?;
        Ok(chat_completion_deltas(Box::pin(response.bytes_stream())))
    }
}

/// Meaning of one `data:` payload of a chat-completions stream.
#[derive(Debug, PartialEq)]
enum Payload {
    Delta(String),
    Finished,
    Ignored,
}

fn interpret_payload(data: &str) -> Result<Payload> {
    if data.trim() == "[DONE]" {
        return Ok(Payload::Finished);
    }

    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Ok(Payload::Ignored),
    };

    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        bail!("generation stream error: {}", message);
    }

    let choice = match json.get("choices").and_then(|c| c.get(0)) {
        Some(c) => c,
        None => return Ok(Payload::Ignored),
    };

    match choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        Some(text) if !text.is_empty() => Ok(Payload::Delta(text.to_string())),
        _ => Ok(Payload::Ignored),
    }
}

struct DeltaState<S> {
    body: S,
    sse: SseBuffer,
    pending: VecDeque<Result<String>>,
    completed: bool,
    finished: bool,
}

/// Adapt a raw chat-completions SSE body into a [`DeltaStream`].
///
/// The stream succeeds only if `[DONE]` was received; a body that ends
/// without it yields an error.
pub fn chat_completion_deltas<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = DeltaState {
        body,
        sse: SseBuffer::new(),
        pending: VecDeque::new(),
        completed: false,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for data in st.sse.push(bytes.as_ref()) {
                        match interpret_payload(&data) {
                            Ok(Payload::Delta(text)) => st.pending.push_back(Ok(text)),
                            Ok(Payload::Finished) => {
                                st.completed = true;
                                st.finished = true;
                                break;
                            }
                            Ok(Payload::Ignored) => {}
                            Err(e) => {
                                st.pending.push_back(Err(e));
                                st.finished = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.pending
                        .push_back(Err(anyhow!("generation stream interrupted: {}", e)));
                    st.finished = true;
                }
                None => {
                    st.finished = true;
                    if !st.completed {
                        st.pending
                            .push_back(Err(anyhow!("generation stream ended before completion")));
                    }
                }
            }
        }
    }))
}

/// Create the [`Generator`] named by `generation.provider`.
///
/// | Config Value | Generator |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledGenerator`] |
/// | `"openai"` | [`OpenAIGenerator`] |
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
