//! Core data models used throughout the assistant.
//!
//! These types represent the articles, retrieved fragments, and conversation
//! turns that flow between the retrieval client, the orchestrator, and the
//! conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A summarized article as produced by the ingestion pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub summary: String,
}

/// A chunk of an article's summary text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub article_id: i64,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// Citation linking an assistant turn to retrieved article content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub title: String,
    pub url: String,
}

/// A ranked piece of retrieved content with its provenance.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub content: String,
    pub source: Source,
    pub score: f64,
}

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A turn waiting to be appended to a conversation.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub role: Role,
    pub content: String,
    pub sources: Vec<Source>,
}

impl NewTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            sources: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<Source>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            sources,
        }
    }
}

/// A persisted turn, as read back from the conversation store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    pub created_at: DateTime<Utc>,
}

/// Conversation header row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
}
