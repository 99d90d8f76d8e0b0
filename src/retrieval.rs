//! Retrieval of article fragments for prompt grounding.
//!
//! The [`Retriever`] trait is the seam between the orchestrator and whatever
//! index holds the summarized articles. [`SqliteRetriever`] searches the
//! local FTS5 index built by `assist import`.
//!
//! # Ranking
//!
//! 1. The user message is reduced to alphanumeric terms, each quoted and
//!    OR-joined, so punctuation in a question never breaks `MATCH`.
//! 2. Up to `candidate_k` chunks are fetched by BM25 rank, optionally limited
//!    to the requested article scope.
//! 3. Scores are min-max normalized to `[0, 1]`.
//! 4. Chunks are grouped per article (MAX aggregation; the best chunk is
//!    kept as the fragment).
//! 5. Articles are sorted by score desc, then id asc, and truncated to
//!    `final_limit`.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::RetrievalConfig;
use crate::models::{Fragment, Source};

/// Capability to find article content relevant to a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return ranked fragments for `query`. When `scope` is given, only
    /// fragments of those article ids may be returned.
    async fn search(&self, query: &str, scope: Option<&[i64]>) -> Result<Vec<Fragment>>;
}

/// Keyword retriever over the `article_chunks_fts` index.
pub struct SqliteRetriever {
    pool: SqlitePool,
    settings: RetrievalConfig,
}

impl SqliteRetriever {
    pub fn new(pool: SqlitePool, settings: RetrievalConfig) -> Self {
        Self { pool, settings }
    }
}

#[derive(Debug, Clone)]
struct ChunkCandidate {
    article_id: i64,
    title: String,
    url: String,
    raw_score: f64,
    text: String,
}

#[async_trait]
impl Retriever for SqliteRetriever {
    async fn search(&self, query: &str, scope: Option<&[i64]>) -> Result<Vec<Fragment>> {
        let match_expr = match build_match_query(query) {
            Some(expr) => expr,
            None => return Ok(Vec::new()),
        };

        let candidates =
            fetch_candidates(&self.pool, &match_expr, scope, self.settings.candidate_k).await?;

        let mut fragments = rank_by_article(&candidates);
        fragments.truncate(self.settings.final_limit.max(0) as usize);
        for fragment in &mut fragments {
            fragment.content = truncate_chars(&fragment.content, self.settings.max_fragment_chars);
        }
        Ok(fragments)
    }
}

/// Turn free text into an FTS5 expression, or `None` when no term survives.
pub fn build_match_query(text: &str) -> Option<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let term = word.to_lowercase();
        if !terms.contains(&term) {
            terms.push(term);
        }
    }

    if terms.is_empty() {
        return None;
    }

    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

async fn fetch_candidates(
    pool: &SqlitePool,
    match_expr: &str,
    scope: Option<&[i64]>,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let scope = scope.filter(|ids| !ids.is_empty());
    let scope_clause = match scope {
        Some(ids) => format!(
            "AND c.article_id IN ({})",
            vec!["?"; ids.len()].join(", ")
        ),
        None => String::new(),
    };

    let sql = format!(
        r#"
        SELECT c.article_id, c.text, a.title, a.url,
               bm25(article_chunks_fts) AS score
        FROM article_chunks_fts
        JOIN article_chunks c ON c.id = article_chunks_fts.chunk_id
        JOIN articles a ON a.id = c.article_id
        WHERE article_chunks_fts MATCH ?
        {}
        ORDER BY score
        LIMIT ?
        "#,
        scope_clause
    );

    let mut query = sqlx::query(&sql).bind(match_expr);
    if let Some(ids) = scope {
        for id in ids {
            query = query.bind(*id);
        }
    }
    let rows = query.bind(candidate_k).fetch_all(pool).await?;

    Ok(rows
        .iter()
        .map(|row| {
            let score: f64 = row.get("score");
            ChunkCandidate {
                article_id: row.get("article_id"),
                title: row.get("title"),
                url: row.get("url"),
                raw_score: -score, // negate so higher = better
                text: row.get("text"),
            }
        })
        .collect())
}

/// Min-max normalize scores to [0, 1]; all-equal scores map to 1.0.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<f64> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

fn rank_by_article(candidates: &[ChunkCandidate]) -> Vec<Fragment> {
    let scores = normalize_scores(candidates);

    let mut best: HashMap<i64, (f64, &ChunkCandidate)> = HashMap::new();
    for (cand, score) in candidates.iter().zip(scores) {
        let entry = best.entry(cand.article_id).or_insert((score, cand));
        if score > entry.0 {
            *entry = (score, cand);
        }
    }

    let mut fragments: Vec<Fragment> = best
        .into_values()
        .map(|(score, cand)| Fragment {
            content: cand.text.clone(),
            source: Source {
                id: cand.article_id,
                title: cand.title.clone(),
                url: cand.url.clone(),
            },
            score,
        })
        .collect();

    fragments.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.source.id.cmp(&b.source.id))
    });
    fragments
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
