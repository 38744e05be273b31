//! Hybrid search over a store's index.
//!
//! - **Keyword** — FTS5 full-text MATCH with BM25 scoring.
//! - **Vector** — cosine similarity over stored chunk embeddings (only when
//!   the provider advertises non-zero dims).
//! - **Merge** — scores normalized to `[0, 1]` by the observed max and
//!   combined per chunk with weights 0.4 keyword + 0.6 vector.
//! - **Temporal decay** — dated files (`YYYY-MM-DD.md` basenames) decay with
//!   age; evergreen files are exempt.
//!
//! Reranking and the min-score/limit trim happen in the manager, after the
//! index read latch has been released.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::EmbeddingConfig;
use crate::embedding;
use crate::error::Result;

/// Snippet cap in returned results.
const SNIPPET_CHARS: usize = 700;

/// Keyword/vector merge weights.
const KEYWORD_WEIGHT: f64 = 0.4;
const VECTOR_WEIGHT: f64 = 0.6;

/// Per-day decay rate applied to dated files.
const DECAY_RATE: f64 = 0.01;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Tokens dropped from keyword queries before building the MATCH expression.
const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "an", "and", "any", "are", "as", "at", "be", "been", "before",
    "being", "but", "by", "can", "did", "do", "does", "for", "from", "had", "has", "have", "how",
    "i", "if", "in", "into", "is", "it", "its", "just", "me", "my", "no", "not", "of", "on", "or",
    "our", "so", "some", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "too", "user", "very", "was", "we", "were", "what", "when", "where", "which",
    "who", "will", "with", "you", "your",
];

/// Search tuning passed by callers.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    pub min_score: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 8,
            min_score: 0.0,
        }
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub score: f64,
    /// Chunk text capped at 700 chars.
    pub snippet: String,
}

struct Candidate {
    path: String,
    start_line: i64,
    end_line: i64,
    raw_score: f64,
    snippet: String,
    mtime_ms: i64,
}

/// Fetch, merge, and decay candidates for `query`.
///
/// `limit` is the candidate budget per side; `has_reranker` enables the
/// unranked-fallback path when both engines come back empty. The caller
/// applies reranking and the final min-score/limit trim.
pub async fn hybrid_candidates(
    pool: &SqlitePool,
    embedding_cfg: &EmbeddingConfig,
    provider_dims: usize,
    query: &str,
    limit: usize,
    has_reranker: bool,
    now_ms: i64,
) -> Result<Vec<SearchResult>> {
    let keyword = keyword_candidates(pool, query, limit).await?;

    let vector = if provider_dims > 0 {
        vector_candidates(pool, embedding_cfg, query, limit).await
    } else {
        Vec::new()
    };

    if keyword.is_empty() && vector.is_empty() {
        if has_reranker {
            // The reranker performs the selection over an unranked slice.
            return unranked_candidates(pool, limit).await;
        }
        return Ok(Vec::new());
    }

    let merged = merge_candidates(&keyword, &vector, limit);
    Ok(apply_temporal_decay(merged, now_ms))
}

// ============ Keyword search ============

/// Build an FTS5 MATCH expression: whitespace tokens, stop words removed,
/// each token quoted, combined with OR. Falls back to the original tokens
/// when everything was a stop word.
fn build_match_query(query: &str) -> Option<String> {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }

    let kept: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| !STOP_WORDS.contains(&t.to_lowercase().as_str()))
        .collect();
    let effective = if kept.is_empty() { &tokens } else { &kept };

    let quoted: Vec<String> = effective
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    Some(quoted.join(" OR "))
}

async fn keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    limit: usize,
) -> Result<Vec<Candidate>> {
    let Some(match_expr) = build_match_query(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT f.path, f.mtime, c.start_line, c.end_line, c.text,
               -bm25(chunks_fts) AS score
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.rowid
        JOIN files f ON f.id = c.file_id
        WHERE chunks_fts MATCH ?
        ORDER BY -bm25(chunks_fts) DESC
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let text: String = row.get("text");
            Candidate {
                path: row.get("path"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                raw_score: row.get("score"),
                snippet: truncate_chars(&text, SNIPPET_CHARS),
                mtime_ms: row.get("mtime"),
            }
        })
        .collect())
}

// ============ Vector search ============

/// Embed the query and rank every stored embedding by cosine similarity.
/// Any failure (provider down, no embeddings) degrades to an empty set.
async fn vector_candidates(
    pool: &SqlitePool,
    embedding_cfg: &EmbeddingConfig,
    query: &str,
    limit: usize,
) -> Vec<Candidate> {
    let query_vec = match embedding::embed_query(embedding_cfg, query).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "query embedding failed, keyword-only search");
            return Vec::new();
        }
    };

    let rows = match sqlx::query(
        r#"
        SELECT f.path, f.mtime, c.start_line, c.end_line, c.text, cv.embedding
        FROM chunks_vec cv
        JOIN chunks c ON c.id = cv.chunk_id
        JOIN files f ON f.id = c.file_id
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "vector candidate load failed");
            return Vec::new();
        }
    };

    let mut candidates: Vec<Candidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            let similarity = embedding::cosine_similarity(&query_vec, &vec) as f64;
            let text: String = row.get("text");
            Candidate {
                path: row.get("path"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                raw_score: similarity,
                snippet: truncate_chars(&text, SNIPPET_CHARS),
                mtime_ms: row.get("mtime"),
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(limit);
    candidates
}

// ============ Fallback ============

/// Unordered chunk slice used when both engines return nothing but a
/// reranker is available to do the selection.
async fn unranked_candidates(pool: &SqlitePool, limit: usize) -> Result<Vec<SearchResult>> {
    let rows = sqlx::query(
        r#"
        SELECT f.path, c.start_line, c.end_line, c.text
        FROM chunks c
        JOIN files f ON f.id = c.file_id
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let text: String = row.get("text");
            SearchResult {
                path: row.get("path"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                score: 0.0,
                snippet: truncate_chars(&text, SNIPPET_CHARS),
            }
        })
        .collect())
}

// ============ Merge and decay ============

/// Normalize each side by its observed max and combine per (path,
/// start_line) with the fixed keyword/vector weights.
fn merge_candidates(
    keyword: &[Candidate],
    vector: &[Candidate],
    limit: usize,
) -> Vec<(SearchResult, i64)> {
    let kw_max = keyword.iter().map(|c| c.raw_score).fold(0.0f64, f64::max);
    let vec_max = vector.iter().map(|c| c.raw_score).fold(0.0f64, f64::max);

    struct Merged {
        keyword: f64,
        vector: f64,
        result: SearchResult,
        mtime_ms: i64,
        order: usize,
    }

    let mut merged: HashMap<(String, i64), Merged> = HashMap::new();
    let mut order = 0usize;

    for c in keyword {
        let norm = if kw_max > 0.0 { c.raw_score / kw_max } else { 0.0 };
        let key = (c.path.clone(), c.start_line);
        let entry = merged.entry(key).or_insert_with(|| {
            order += 1;
            Merged {
                keyword: 0.0,
                vector: 0.0,
                result: to_result(c),
                mtime_ms: c.mtime_ms,
                order,
            }
        });
        entry.keyword = entry.keyword.max(norm);
    }

    for c in vector {
        let norm = if vec_max > 0.0 { c.raw_score / vec_max } else { 0.0 };
        let key = (c.path.clone(), c.start_line);
        let entry = merged.entry(key).or_insert_with(|| {
            order += 1;
            Merged {
                keyword: 0.0,
                vector: 0.0,
                result: to_result(c),
                mtime_ms: c.mtime_ms,
                order,
            }
        });
        entry.vector = entry.vector.max(norm);
    }

    let mut combined: Vec<Merged> = merged.into_values().collect();
    for m in &mut combined {
        m.result.score = KEYWORD_WEIGHT * m.keyword + VECTOR_WEIGHT * m.vector;
    }

    // Ties break by insertion order for determinism.
    combined.sort_by(|a, b| {
        b.result
            .score
            .partial_cmp(&a.result.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.order.cmp(&b.order))
    });
    combined.truncate(limit);

    combined
        .into_iter()
        .map(|m| (m.result, m.mtime_ms))
        .collect()
}

fn to_result(c: &Candidate) -> SearchResult {
    SearchResult {
        path: c.path.clone(),
        start_line: c.start_line,
        end_line: c.end_line,
        score: 0.0,
        snippet: c.snippet.clone(),
    }
}

/// `true` for basenames shaped `YYYY-MM-DD.md` (daily notes, subject to
/// temporal decay).
pub fn is_dated_filename(path: &str) -> bool {
    let base = path.rsplit('/').next().unwrap_or(path);
    let bytes = base.as_bytes();
    if bytes.len() != 13 || !base.ends_with(".md") {
        return false;
    }
    bytes[..10].iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    })
}

/// Decay dated files by age; evergreen files keep their score. Resorts.
fn apply_temporal_decay(merged: Vec<(SearchResult, i64)>, now_ms: i64) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = merged
        .into_iter()
        .map(|(mut r, mtime_ms)| {
            if is_dated_filename(&r.path) {
                let age_days = ((now_ms - mtime_ms).max(0)) as f64 / MS_PER_DAY;
                r.score *= (-DECAY_RATE * age_days).exp();
            }
            r
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        text.chars().take(cap).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_match_query_quotes_and_ors() {
        let q = build_match_query("Go language preference").unwrap();
        assert_eq!(q, "\"Go\" OR \"language\" OR \"preference\"");
    }

    #[test]
    fn test_build_match_query_drops_stop_words() {
        let q = build_match_query("what is the hardware").unwrap();
        assert_eq!(q, "\"hardware\"");
    }

    #[test]
    fn test_build_match_query_all_stop_words_uses_originals() {
        let q = build_match_query("what is the").unwrap();
        assert_eq!(q, "\"what\" OR \"is\" OR \"the\"");
    }

    #[test]
    fn test_build_match_query_empty() {
        assert!(build_match_query("   ").is_none());
    }

    #[test]
    fn test_build_match_query_escapes_quotes() {
        let q = build_match_query("say \"hi\"").unwrap();
        assert!(q.contains("\"\"hi\"\""));
    }

    #[test]
    fn test_is_dated_filename() {
        assert!(is_dated_filename("2026-01-01.md"));
        assert!(is_dated_filename("notes/2025-12-31.md"));
        assert!(!is_dated_filename("global.md"));
        assert!(!is_dated_filename("2026-1-01.md"));
        assert!(!is_dated_filename("2026-01-01.txt"));
        assert!(!is_dated_filename("x2026-01-01.md"));
    }

    fn result(path: &str, score: f64) -> (SearchResult, i64) {
        (
            SearchResult {
                path: path.to_string(),
                start_line: 1,
                end_line: 1,
                score,
                snippet: String::new(),
            },
            0, // mtime at epoch: very old
        )
    }

    #[test]
    fn test_decay_only_touches_dated_files() {
        let now_ms = 1_750_000_000_000; // far from epoch
        let merged = vec![result("2020-01-01.md", 0.9), result("global.md", 0.9)];
        let decayed = apply_temporal_decay(merged, now_ms);

        let dated = decayed.iter().find(|r| r.path == "2020-01-01.md").unwrap();
        let evergreen = decayed.iter().find(|r| r.path == "global.md").unwrap();
        assert!(dated.score < 0.9);
        assert!((evergreen.score - 0.9).abs() < 1e-12);
        // Evergreen outranks the decayed daily note.
        assert_eq!(decayed[0].path, "global.md");
    }

    #[test]
    fn test_merge_weights_and_order() {
        let kw = vec![Candidate {
            path: "a.md".into(),
            start_line: 1,
            end_line: 2,
            raw_score: 4.0,
            snippet: "kw".into(),
            mtime_ms: 0,
        }];
        let vec_side = vec![
            Candidate {
                path: "a.md".into(),
                start_line: 1,
                end_line: 2,
                raw_score: 0.5,
                snippet: "vec".into(),
                mtime_ms: 0,
            },
            Candidate {
                path: "b.md".into(),
                start_line: 3,
                end_line: 4,
                raw_score: 1.0,
                snippet: "vec b".into(),
                mtime_ms: 0,
            },
        ];

        let merged = merge_candidates(&kw, &vec_side, 10);
        let by_path: HashMap<&str, f64> = merged
            .iter()
            .map(|(r, _)| (r.path.as_str(), r.score))
            .collect();

        // a: 0.4×1.0 + 0.6×0.5 = 0.7; b: 0.6×1.0 = 0.6
        assert!((by_path["a.md"] - 0.7).abs() < 1e-9);
        assert!((by_path["b.md"] - 0.6).abs() < 1e-9);
        assert_eq!(merged[0].0.path, "a.md");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc");
    }
}
