//! Conversation store: the append-only log of turns.
//!
//! The [`ConversationStore`] trait is what the orchestrator persists to.
//! Two implementations are provided:
//!
//! | Store | Backing | Use |
//! |-------|---------|-----|
//! | [`SqliteConversationStore`] | `conversations` + `turns` tables | server and CLI |
//! | [`InMemoryConversationStore`] | `HashMap` behind `RwLock` | tests, embedding |
//!
//! Both write all turns of one call atomically, so a request's user and
//! assistant turns are always adjacent within that request, even when
//! several requests append to the same conversation concurrently.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::models::{Conversation, NewTurn, Role, Source, Turn};

/// Durable, append-only log of turns keyed by conversation id.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append `turns` to the conversation, creating it first when it does
    /// not exist. With no id a fresh one is minted. Returns the id written.
    async fn create_or_append(
        &self,
        conversation_id: Option<&str>,
        turns: &[NewTurn],
    ) -> Result<String>;

    /// All turns of the conversation in append order; empty when unknown.
    async fn read_history(&self, conversation_id: &str) -> Result<Vec<Turn>>;

    /// Header of the conversation, if it exists.
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>>;
}

pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

fn from_timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

// ============ SQLite ============

pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_or_append(
        &self,
        conversation_id: Option<&str>,
        turns: &[NewTurn],
    ) -> Result<String> {
        let id = conversation_id
            .map(str::to_string)
            .unwrap_or_else(new_conversation_id);
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO conversations (id, created_at) VALUES (?, ?)")
            .bind(&id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        for turn in turns {
            sqlx::query(
                "INSERT INTO turns (conversation_id, role, content, sources_json, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(serde_json::to_string(&turn.sources)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn read_history(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT role, content, sources_json, created_at FROM turns WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in &rows {
            let role: String = row.get("role");
            let sources_json: String = row.get("sources_json");
            let sources: Vec<Source> = serde_json::from_str(&sources_json).map_err(|e| {
                anyhow::anyhow!("invalid sources_json in turns table: {}", e)
            })?;
            turns.push(Turn {
                conversation_id: conversation_id.to_string(),
                role: Role::parse(&role)
                    .ok_or_else(|| anyhow::anyhow!("invalid role in turns table: {}", role))?,
                content: row.get("content"),
                sources,
                created_at: from_timestamp(row.get("created_at")),
            });
        }
        Ok(turns)
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT id, created_at FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Conversation {
            id: row.get("id"),
            created_at: from_timestamp(row.get("created_at")),
        }))
    }
}

// ============ In-memory ============

struct StoredConversation {
    created_at: DateTime<Utc>,
    turns: Vec<Turn>,
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, StoredConversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of turns across all conversations.
    pub fn turn_count(&self) -> usize {
        self.conversations
            .read()
            .map(|c| c.values().map(|s| s.turns.len()).sum())
            .unwrap_or(0)
    }

    /// Number of conversations.
    pub fn len(&self) -> usize {
        self.conversations.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_or_append(
        &self,
        conversation_id: Option<&str>,
        turns: &[NewTurn],
    ) -> Result<String> {
        let id = conversation_id
            .map(str::to_string)
            .unwrap_or_else(new_conversation_id);
        let now = Utc::now();

        let mut conversations = self
            .conversations
            .write()
            .map_err(|e| anyhow::anyhow!("conversation lock poisoned: {}", e))?;
        let stored = conversations
            .entry(id.clone())
            .or_insert_with(|| StoredConversation {
                created_at: now,
                turns: Vec::new(),
            });
        stored.turns.extend(turns.iter().map(|t| Turn {
            conversation_id: id.clone(),
            role: t.role,
            content: t.content.clone(),
            sources: t.sources.clone(),
            created_at: now,
        }));

        Ok(id)
    }

    async fn read_history(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let conversations = self
            .conversations
            .read()
            .map_err(|e| anyhow::anyhow!("conversation lock poisoned: {}", e))?;
        Ok(conversations
            .get(conversation_id)
            .map(|s| s.turns.clone())
            .unwrap_or_default())
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conversations = self
            .conversations
            .read()
            .map_err(|e| anyhow::anyhow!("conversation lock poisoned: {}", e))?;
        Ok(conversations.get(conversation_id).map(|s| Conversation {
            id: conversation_id.to_string(),
            created_at: s.created_at,
        }))
    }
}
