//! # Article Assistant CLI (`assist`)
//!
//! The `assist` binary initializes the database, imports summarized
//! articles, answers questions about them, and serves the streaming chat
//! API.
//!
//! ## Usage
//!
//! ```bash
//! assist --config ./config/assist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `assist init` | Create the SQLite database and run schema migrations |
//! | `assist import <file>` | Import a JSON array of summarized articles |
//! | `assist ask "<question>"` | Ask a question; the answer streams to stdout |
//! | `assist history <id>` | Print every turn of a conversation |
//! | `assist serve` | Start the HTTP chat server |
//!
//! ## Examples
//!
//! ```bash
//! assist init
//! assist import ./data/articles.json
//!
//! # Ask across the whole library, then follow up in the same conversation
//! assist ask "What drove cloud prices up?"
//! assist ask "And for storage?" --conversation 3f0c...
//!
//! # Only consult two articles
//! assist ask "Compare these" --article 42 --article 7
//!
//! # Ask a running server instead of the local database
//! assist ask "What changed?" --remote http://127.0.0.1:7341
//! ```

use article_assistant::{ask, config, ingest, migrate, server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Article Assistant CLI: grounded answers over a library of summarized
/// articles.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "assist",
    about = "Article Assistant: retrieval-augmented chat over summarized articles",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/assist.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// more than once is safe.
    Init,

    /// Import summarized articles from a JSON file.
    ///
    /// The file holds an array of `{"id", "title", "url", "summary"}`
    /// objects. Re-importing an article replaces its indexed chunks.
    Import {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Ask a question and stream the answer.
    Ask {
        /// The question.
        question: String,

        /// Continue this conversation.
        #[arg(long)]
        conversation: Option<String>,

        /// Only consult this article (repeatable).
        #[arg(long = "article")]
        articles: Vec<i64>,

        /// Base URL of a running `assist serve` to ask instead of the local database.
        #[arg(long)]
        remote: Option<String>,
    },

    /// Print the turns of a conversation.
    History {
        /// Conversation id.
        id: String,
    },

    /// Start the HTTP chat server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Serve) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { file } => {
            ingest::run_import(&cfg, &file).await?;
        }
        Commands::Ask {
            question,
            conversation,
            articles,
            remote,
        } => {
            ask::run_ask(&cfg, &question, conversation, articles, remote).await?;
        }
        Commands::History { id } => {
            ask::run_history(&cfg, &id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
