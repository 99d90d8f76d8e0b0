//! Prompt assembly.
//!
//! A prompt is the fixed system instructions, followed by a context block
//! with every retrieved fragment tagged by its numbered source, the prior
//! turns of the conversation in order, and finally the new user message.
//!
//! ```text
//! system:    <instructions>
//!
//!            Sources:
//!            [1] Pricing Deep Dive (https://x/42)
//!            <fragment text>
//! user:      <turn 1>
//! assistant: <turn 2>
//! user:      <new message>
//! ```

use serde::Serialize;

use crate::models::{Fragment, Role, Source, Turn};

/// One message of the chat-completion style prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

/// Everything the generation client needs to produce an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    /// The system message, always first.
    pub fn system(&self) -> &str {
        self.messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// The final user message.
    pub fn question(&self) -> &str {
        self.messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

pub fn build_prompt(
    instructions: &str,
    fragments: &[Fragment],
    history: &[Turn],
    message: &str,
) -> Prompt {
    let mut messages = Vec::with_capacity(history.len() + 2);

    messages.push(PromptMessage {
        role: "system",
        content: format!("{}\n\n{}", instructions.trim(), context_block(fragments)),
    });

    for turn in history {
        messages.push(PromptMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: turn.content.clone(),
        });
    }

    messages.push(PromptMessage {
        role: "user",
        content: message.to_string(),
    });

    Prompt { messages }
}

fn context_block(fragments: &[Fragment]) -> String {
    if fragments.is_empty() {
        return "Sources: none were found for this question. Answer from the conversation \
                so far and say that no matching articles were found."
            .to_string();
    }

    let mut block = String::from("Sources:");
    for (i, fragment) in fragments.iter().enumerate() {
        block.push_str(&format!(
            "\n\n[{}] {}\n{}",
            i + 1,
            source_label(&fragment.source),
            fragment.content.trim()
        ));
    }
    block
}

fn source_label(source: &Source) -> String {
    format!("{} ({})", source.title, source.url)
}

/// Distinct sources of the given fragments, in rank order.
pub fn sources_of(fragments: &[Fragment]) -> Vec<Source> {
    let mut sources: Vec<Source> = Vec::new();
    for fragment in fragments {
        if !sources.iter().any(|s| s.id == fragment.source.id) {
            sources.push(fragment.source.clone());
        }
    }
    sources
}
