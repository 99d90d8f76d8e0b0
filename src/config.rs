//! TOML configuration parsing and validation.
//!
//! Every command reads a single configuration file (default
//! `./config/assist.toml`). Only `[db]` and `[server]` are required; all
//! other sections fall back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/assist.sqlite"
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [chat]
//! unknown_conversation = "reject"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_max_fragment_chars")]
    pub max_fragment_chars: usize,
    #[serde(default = "default_retrieval_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            candidate_k: default_candidate_k(),
            max_fragment_chars: default_max_fragment_chars(),
            timeout_secs: default_retrieval_timeout_secs(),
        }
    }
}

fn default_final_limit() -> i64 {
    6
}
fn default_candidate_k() -> i64 {
    40
}
fn default_max_fragment_chars() -> usize {
    1200
}
fn default_retrieval_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    120
}

/// What the orchestrator does with a conversation id it has never seen.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownConversation {
    /// Fail fast with `404` before any stream is opened.
    #[default]
    Reject,
    /// Start a new conversation under the caller-supplied id.
    Adopt,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_max_scope_ids")]
    pub max_scope_ids: usize,
    #[serde(default)]
    pub unknown_conversation: UnknownConversation,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_message_chars: default_max_message_chars(),
            max_scope_ids: default_max_scope_ids(),
            unknown_conversation: UnknownConversation::default(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a research assistant answering questions about a library of summarized \
     articles. Ground every answer in the provided sources and cite them as [n] using \
     the number of the source block. If the sources do not contain the answer, say so \
     plainly instead of guessing."
        .to_string()
}
fn default_max_message_chars() -> usize {
    4000
}
fn default_max_scope_ids() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Config {
    /// Configuration pointing at the given database, with defaults everywhere
    /// else. Used by tests and by callers embedding the library.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig::new(path),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            chat: ChatConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:7341".to_string(),
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.candidate_k < config.retrieval.final_limit {
        anyhow::bail!("retrieval.candidate_k must be >= retrieval.final_limit");
    }

    if config.chat.max_message_chars == 0 {
        anyhow::bail!("chat.max_message_chars must be > 0");
    }

    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.generation.model.is_none() {
                anyhow::bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
