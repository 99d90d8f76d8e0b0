//! Paragraph-boundary text chunker for article summaries.
//!
//! Splits summary text into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! so each retrieved fragment reads as coherent prose.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting max_tokens.
/// Returns chunks with contiguous indices starting at 0. Blank text yields
/// no chunks.
pub fn chunk_text(article_id: i64, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            split_long_paragraph(trimmed, max_chars, &mut pieces);
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, text)| make_chunk(article_id, i as i64, text))
        .collect()
}

/// Hard-split an oversized paragraph, preferring whitespace boundaries.
fn split_long_paragraph(paragraph: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let mut split_at = remaining.len().min(max_chars);
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        let actual = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind(char::is_whitespace)
                .filter(|pos| *pos > 0)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let actual = if actual == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            actual
        };
        let piece = remaining[..actual].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = remaining[actual..].trim_start();
    }
}

fn make_chunk(article_id: i64, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        article_id,
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
