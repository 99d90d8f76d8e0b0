//! SQLite pool setup.
//!
//! One pool serves articles, chunks, the FTS index, and conversations. WAL
//! mode lets the retriever read while a turn pair is being committed, and
//! the busy timeout covers concurrent appends from parallel requests.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{Config, DbConfig};
use crate::migrate;

/// Open (creating if needed) the database named in `[db].path`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    open(&config.db).await
}

async fn open(db: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = db.path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db.path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(db.busy_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(options)
        .await?;

    tracing::debug!(path = %db.path.display(), "database opened");
    Ok(pool)
}

/// Private migrated database that lives as long as the pool.
///
/// Limited to a single connection: every `sqlite::memory:` connection is a
/// separate database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    migrate::apply(&pool).await?;
    Ok(pool)
}
