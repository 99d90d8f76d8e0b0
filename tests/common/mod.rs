#![allow(dead_code)]

use anyhow::{bail, Result};
use article_assistant::conversation::{ConversationStore, InMemoryConversationStore};
use article_assistant::generation::{DeltaStream, Generator};
use article_assistant::models::{Conversation, Fragment, NewTurn, Source, Turn};
use article_assistant::orchestrator::{ChatSettings, Orchestrator};
use article_assistant::prompt::Prompt;
use article_assistant::retrieval::Retriever;
use article_assistant::stream::StreamEvent;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn source(id: i64, title: &str) -> Source {
    Source {
        id,
        title: title.to_string(),
        url: format!("https://x/{}", id),
    }
}

pub fn fragment(id: i64, title: &str, content: &str) -> Fragment {
    Fragment {
        content: content.to_string(),
        source: source(id, title),
        score: 1.0,
    }
}

pub fn pricing_fragment() -> Fragment {
    fragment(42, "Pricing Deep Dive", "Prices rose 20% after the vendor change.")
}

// ============ Retrievers ============

/// Returns its fragments, filtered by scope, and records every call.
#[derive(Default)]
pub struct StaticRetriever {
    pub fragments: Vec<Fragment>,
    pub calls: Mutex<Vec<(String, Option<Vec<i64>>)>>,
}

impl StaticRetriever {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self {
            fragments,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn scopes(&self) -> Vec<Option<Vec<i64>>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn search(&self, query: &str, scope: Option<&[i64]>) -> Result<Vec<Fragment>> {
        self.calls
            .lock()
            .unwrap()
            .push((query.to_string(), scope.map(|s| s.to_vec())));
        Ok(self
            .fragments
            .iter()
            .filter(|f| scope.map(|s| s.contains(&f.source.id)).unwrap_or(true))
            .cloned()
            .collect())
    }
}

pub struct FailingRetriever;

#[async_trait]
impl Retriever for FailingRetriever {
    async fn search(&self, _query: &str, _scope: Option<&[i64]>) -> Result<Vec<Fragment>> {
        bail!("index offline")
    }
}

pub struct SlowRetriever;

#[async_trait]
impl Retriever for SlowRetriever {
    async fn search(&self, _query: &str, _scope: Option<&[i64]>) -> Result<Vec<Fragment>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec![pricing_fragment()])
    }
}

// ============ Generators ============

/// Yields its deltas in order, then optionally fails. Records prompts.
pub struct ScriptedGenerator {
    pub deltas: Vec<String>,
    pub fail_with: Option<String>,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    pub fn answering(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            fail_with: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_after(deltas: &[&str], error: &str) -> Self {
        Self {
            fail_with: Some(error.to_string()),
            ..Self::answering(deltas)
        }
    }

    pub fn last_prompt(&self) -> Prompt {
        self.prompts.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<DeltaStream> {
        self.prompts.lock().unwrap().push(prompt.clone());

        let mut items: Vec<Result<String>> = self.deltas.iter().cloned().map(Ok).collect();
        if let Some(ref error) = self.fail_with {
            items.push(Err(anyhow::anyhow!("{}", error)));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Rejects the prompt before producing anything.
pub struct RefusingGenerator;

#[async_trait]
impl Generator for RefusingGenerator {
    fn model_name(&self) -> &str {
        "refusing"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<DeltaStream> {
        bail!("provider returned 401")
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Yields one delta and then never finishes. `cancelled` flips once the
/// stream is dropped.
pub struct HangingGenerator {
    pub cancelled: Arc<AtomicBool>,
}

impl HangingGenerator {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Generator for HangingGenerator {
    fn model_name(&self) -> &str {
        "hanging"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<DeltaStream> {
        let guard = DropFlag(self.cancelled.clone());
        let first = stream::iter(vec![Ok("Pric".to_string())]);
        let rest = stream::pending::<Result<String>>().map(move |item| {
            let _keep = &guard;
            item
        });
        Ok(Box::pin(first.chain(rest)))
    }
}

// ============ Stores ============

/// Reads work; every write fails.
#[derive(Default)]
pub struct ReadOnlyStore {
    pub inner: InMemoryConversationStore,
}

#[async_trait]
impl ConversationStore for ReadOnlyStore {
    async fn create_or_append(
        &self,
        _conversation_id: Option<&str>,
        _turns: &[NewTurn],
    ) -> Result<String> {
        bail!("database is locked")
    }

    async fn read_history(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        self.inner.read_history(conversation_id).await
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.inner.get(conversation_id).await
    }
}

// ============ Helpers ============

pub fn orchestrator(
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn ConversationStore>,
) -> Orchestrator {
    let settings = ChatSettings {
        retrieval_timeout: Duration::from_millis(200),
        ..ChatSettings::default()
    };
    Orchestrator::new(retriever, generator, store, settings)
}

/// Drain the receiver until it closes.
pub async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Concatenated text of all `content` events.
pub fn answer_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

pub async fn wait_for(flag: &AtomicBool) -> bool {
    for _ in 0..200 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
