//! Article import.
//!
//! The summarization pipeline that produces articles lives outside this
//! crate. `assist import` loads its output (a JSON array of
//! `{id, title, url, summary}`), chunks each summary, and indexes the chunks
//! for retrieval. Re-importing an article replaces its chunks.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::path::Path;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::db;
use crate::models::{Article, Chunk};

/// Counts reported by [`import_articles`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub articles: u64,
    pub chunks: u64,
}

pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read articles file: {}", path.display()))?;
    let articles: Vec<Article> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse articles file: {}", path.display()))?;

    let pool = db::connect(config).await?;
    let stats = import_articles(&pool, &articles, config.chunking.max_tokens).await?;
    pool.close().await;

    println!("import {}", path.display());
    println!("  upserted articles: {}", stats.articles);
    println!("  chunks written: {}", stats.chunks);
    println!("ok");
    Ok(())
}

/// Upsert each article and rebuild its chunk index.
pub async fn import_articles(
    pool: &SqlitePool,
    articles: &[Article],
    max_tokens: usize,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();

    for article in articles {
        if article.id <= 0 {
            bail!("article id must be positive, got {}", article.id);
        }
        upsert_article(pool, article).await?;
        let chunks = chunk_text(article.id, &article.summary, max_tokens);
        replace_chunks(pool, article.id, &chunks).await?;

        stats.articles += 1;
        stats.chunks += chunks.len() as u64;
    }

    Ok(stats)
}

async fn upsert_article(pool: &SqlitePool, article: &Article) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO articles (id, title, url, summary, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            url = excluded.url,
            summary = excluded.summary,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(article.id)
    .bind(&article.title)
    .bind(&article.url)
    .bind(&article.summary)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

async fn replace_chunks(pool: &SqlitePool, article_id: i64, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM article_chunks_fts WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM article_chunks WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO article_chunks (id, article_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(chunk.article_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO article_chunks_fts (chunk_id, article_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(chunk.article_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
