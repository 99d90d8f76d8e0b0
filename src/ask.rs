//! CLI conversation commands: `assist ask` and `assist history`.
//!
//! `ask` streams the answer to stdout as it is generated. By default the
//! orchestrator runs in-process against the local database; with `--remote`
//! the question is sent to a running `assist serve` instead. Either way the
//! answer is driven through the same [`ChatView`] a front-end would use.

use anyhow::{bail, Result};
use std::io::Write;

use crate::client::{ChatClient, ChatView, ViewState};
use crate::config::Config;
use crate::conversation::{ConversationStore, SqliteConversationStore};
use crate::db;
use crate::orchestrator::Orchestrator;
use crate::stream::StreamEvent;

fn print_delta(event: &StreamEvent) {
    if let StreamEvent::Content { content } = event {
        print!("{}", content);
        let _ = std::io::stdout().flush();
    }
}

pub async fn run_ask(
    config: &Config,
    question: &str,
    conversation: Option<String>,
    articles: Vec<i64>,
    remote: Option<String>,
) -> Result<()> {
    let mut view = match conversation {
        Some(id) => ChatView::resume(id),
        None => ChatView::new(),
    };
    view.set_scope(articles);

    match remote {
        Some(url) => {
            let client = ChatClient::new(&url)?;
            client.send(&mut view, question, print_delta).await?;
        }
        None => {
            let pool = db::connect(config).await?;
            let orchestrator = Orchestrator::from_config(config, pool)?;

            let request = view.begin(question)?;
            let mut events = match orchestrator.handle(request).await {
                Ok(rx) => rx,
                Err(e) => {
                    view.fail(e.to_string());
                    return Err(e.into());
                }
            };

            while let Some(event) = events.recv().await {
                print_delta(&event);
                if view.apply(event) {
                    break;
                }
            }
            view.abort();
        }
    }

    println!();
    match view.state() {
        ViewState::Errored(message) => bail!("{}", message),
        ViewState::Streaming => bail!("answer did not complete"),
        ViewState::Idle => {}
    }

    if let Some(answer) = view.turns().last() {
        if !answer.sources.is_empty() {
            println!();
            println!("--- Sources ---");
            for (i, source) in answer.sources.iter().enumerate() {
                println!("[{}] {} ({}) #{}", i + 1, source.title, source.url, source.id);
            }
        }
    }
    if let Some(id) = view.conversation_id() {
        println!();
        println!("conversation: {}", id);
    }

    Ok(())
}

pub async fn run_history(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteConversationStore::new(pool);

    let conversation = match store.get(id).await? {
        Some(c) => c,
        None => bail!("conversation not found: {}", id),
    };
    let turns = store.read_history(id).await?;

    println!("--- Conversation ---");
    println!("id:         {}", conversation.id);
    println!("created_at: {}", conversation.created_at.to_rfc3339());
    println!("turns:      {}", turns.len());
    println!();

    for turn in &turns {
        println!("[{}] {}", turn.role, turn.created_at.to_rfc3339());
        println!("{}", turn.content);
        for source in &turn.sources {
            println!("  source: #{} {} ({})", source.id, source.title, source.url);
        }
        println!();
    }

    Ok(())
}
