//! # Article Assistant
//!
//! A retrieval-augmented conversational assistant over a library of
//! summarized articles.
//!
//! A user message goes through retrieval (ranked fragments from the
//! indexed articles, optionally scoped to a set of article ids), prompt
//! assembly with the conversation's history, and streaming generation.
//! Answer text is delivered incrementally as `data: {json}\n\n` frames and
//! the finished user/assistant turn pair is persisted with its sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Import   │──▶│    SQLite    │◀──│  Retriever   │
//! │ Chunk+FTS5 │   │ articles     │   └──────┬───────┘
//! └────────────┘   │ turns        │          │
//!                  └──────▲───────┘   ┌──────▼───────┐   ┌───────────┐
//!                         │           │ Orchestrator │──▶│ Generator │
//!                  ConversationStore ─┤              │◀──│ (stream)  │
//!                                     └──────┬───────┘   └───────────┘
//!                                            │ StreamEvent
//!                                 ┌──────────┴──────────┐
//!                                 ▼                     ▼
//!                           ┌──────────┐          ┌──────────┐
//!                           │   HTTP   │─frames──▶│ ChatView │
//!                           │  /chat   │          │ (client) │
//!                           └──────────┘          └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Chat error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`chunk`] | Summary chunking |
//! | [`ingest`] | Article import |
//! | [`retrieval`] | Retriever capability and FTS5 implementation |
//! | [`prompt`] | Prompt assembly |
//! | [`generation`] | Generator capability and streaming client |
//! | [`conversation`] | Conversation store capability and implementations |
//! | [`orchestrator`] | Per-message coordination |
//! | [`stream`] | Event framing and decoding |
//! | [`client`] | Consumer state machine and HTTP client |
//! | [`server`] | HTTP server |
//! | [`ask`] | `ask` and `history` commands |

pub mod ask;
pub mod chunk;
pub mod client;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod retrieval;
pub mod server;
pub mod stream;
