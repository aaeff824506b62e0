//! Hybrid retrieval: BM25 lexical search fused with vector KNN, plus a
//! substring scan when neither ranked path yields anything.
//!
//! Each path oversamples three times the requested result count, scores are
//! min-max normalized per path and fused 50/50 keyed by `(path, startLine)`,
//! and returned rows get an access-count bump that feeds a small usage boost
//! into the final ordering. Time filters resolve against file mtime.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::db;
use crate::embedding::{self, LazyEmbedder};
use crate::segment;

/// Caller-tunable knobs; all optional.
#[derive(Debug, Default, Clone)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    pub token_max: Option<usize>,
    /// ISO-8601 lower bound on file modification time.
    pub after: Option<String>,
    /// ISO-8601 upper bound on file modification time.
    pub before: Option<String>,
}

/// A single search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub score: f64,
    pub snippet: String,
    pub source: String,
}

/// Reserved per-result token overhead (path, lines, score fields).
const RESULT_OVERHEAD_TOKENS: usize = 30;
/// Rough tokens consumed by one result's snippet at the default budget.
const SNIPPET_BASE_TOKENS: usize = 200;

struct Candidate {
    path: String,
    source: String,
    start_line: usize,
    end_line: usize,
    text: String,
    score: f64,
}

/// Run a hybrid search over the index.
pub fn search(
    conn: &mut Connection,
    embedder: &LazyEmbedder,
    query: &str,
    options: &SearchOptions,
    default_token_max: usize,
) -> Result<Vec<SearchResult>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let token_max = options.token_max.unwrap_or(default_token_max);
    let max_results = options
        .max_results
        .unwrap_or_else(|| (token_max / (SNIPPET_BASE_TOKENS + RESULT_OVERHEAD_TOKENS)).clamp(1, 20));
    let min_score = options.min_score.unwrap_or(0.01);

    let snippet_tokens = (token_max.saturating_sub(RESULT_OVERHEAD_TOKENS * max_results)
        / max_results)
        .max(50);
    let snippet_max_chars = (snippet_tokens * 3).min(700);

    let allowed = allowed_paths(conn, options)?;
    let oversample = max_results * 3;

    let fts_hits = if db::fts_available(conn) {
        lexical_search(conn, query, oversample, min_score, allowed.as_ref())?
    } else {
        Vec::new()
    };

    let vec_hits = if db::vec_available(conn) && embedder.available() {
        match embedder.embed(query) {
            Ok(vector) => vector_search(conn, &vector, oversample, min_score, allowed.as_ref())?,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, lexical only");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let mut candidates = match (fts_hits.is_empty(), vec_hits.is_empty()) {
        (false, false) => fuse(fts_hits, vec_hits),
        (false, true) => fts_hits,
        (true, false) => vec_hits,
        (true, true) => substring_scan(conn, query, oversample, min_score, allowed.as_ref())?,
    };
    candidates.retain(|c| c.score >= min_score);

    sort_by_score(&mut candidates);
    candidates.truncate(max_results);

    boost_by_access(conn, &mut candidates)?;

    Ok(candidates
        .into_iter()
        .map(|c| SearchResult {
            snippet: truncate_chars(&c.text, snippet_max_chars),
            path: c.path,
            start_line: c.start_line,
            end_line: c.end_line,
            score: c.score,
            source: c.source,
        })
        .collect())
}

// ── Time filter ───────────────────────────────────────────────────────────────

/// Prefetch the set of paths whose file mtime lies inside `[after, before]`.
/// None means no time filter (all paths allowed).
fn allowed_paths(conn: &Connection, options: &SearchOptions) -> Result<Option<HashSet<String>>> {
    let after = options.after.as_deref().map(parse_epoch_ms).transpose()?;
    let before = options.before.as_deref().map(parse_epoch_ms).transpose()?;
    if after.is_none() && before.is_none() {
        return Ok(None);
    }

    let mut stmt = conn.prepare(
        "SELECT path FROM files WHERE mtime >= ?1 AND mtime <= ?2",
    )?;
    let paths = stmt
        .query_map(
            params![after.unwrap_or(i64::MIN), before.unwrap_or(i64::MAX)],
            |row| row.get(0),
        )?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(Some(paths))
}

/// Parse an ISO-8601 timestamp (or bare date) to epoch milliseconds.
fn parse_epoch_ms(raw: &str) -> Result<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("invalid time filter {raw:?}: {e}"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    Ok(midnight.timestamp_millis())
}

fn admit(allowed: Option<&HashSet<String>>, path: &str) -> bool {
    allowed.map(|set| set.contains(path)).unwrap_or(true)
}

// ── Lexical path ──────────────────────────────────────────────────────────────

fn lexical_search(
    conn: &Connection,
    query: &str,
    limit: usize,
    min_score: f64,
    allowed: Option<&HashSet<String>>,
) -> Result<Vec<Candidate>> {
    let tokens = segment::segment_for_query(query);
    let match_expr = fts_match_expression(&tokens);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT c.path, c.source, c.start_line, c.end_line, c.text, chunks_fts.rank \
         FROM chunks_fts JOIN chunks c ON c.id = chunks_fts.id \
         WHERE chunks_fts MATCH ?1 ORDER BY chunks_fts.rank LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![match_expr, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .map(|(path, source, start, end, text, rank)| Candidate {
            path,
            source,
            start_line: start as usize,
            end_line: end as usize,
            text,
            score: bm25_rank_to_score(rank),
        })
        .filter(|c| c.score >= min_score && admit(allowed, &c.path))
        .collect())
}

/// Quote each token (embedded quotes deleted) and join with ` OR `.
fn fts_match_expression(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .filter(|t| t != "\"\"")
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// BM25 rank is a negative float, lower is better. Map it into [0, 1].
fn bm25_rank_to_score(rank: f64) -> f64 {
    if !rank.is_finite() || rank == 0.0 {
        return 0.0;
    }
    (1.0 + rank.abs().log10() / 10.0).clamp(0.0, 1.0)
}

// ── Vector path ───────────────────────────────────────────────────────────────

/// KNN over `chunks_vec`, then hydrate the chunk rows by id. The KNN query
/// runs against the vec table alone so the limit reaches the index.
fn vector_search(
    conn: &Connection,
    query_vector: &[f32],
    limit: usize,
    min_score: f64,
    allowed: Option<&HashSet<String>>,
) -> Result<Vec<Candidate>> {
    let blob = embedding::vector_to_bytes(query_vector);

    let mut stmt = conn.prepare(
        "SELECT id, distance FROM chunks_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let neighbors = stmt
        .query_map(params![blob, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut chunk_stmt = conn.prepare(
        "SELECT path, source, start_line, end_line, text FROM chunks WHERE id = ?1",
    )?;
    let mut candidates = Vec::with_capacity(neighbors.len());
    for (id, distance) in neighbors {
        let row = chunk_stmt
            .query_row(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?;
        let Some((path, source, start, end, text)) = row else {
            continue;
        };
        let candidate = Candidate {
            path,
            source,
            start_line: start as usize,
            end_line: end as usize,
            text,
            score: 1.0 - distance, // cosine distance → similarity
        };
        if candidate.score >= min_score && admit(allowed, &candidate.path) {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

// ── Fusion ────────────────────────────────────────────────────────────────────

/// Min-max normalize each list independently, then combine 50/50 keyed by
/// `(path, startLine)`. A key present in only one list contributes 0 from
/// the other. Insertion order (lexical first) breaks ties via stable sort.
fn fuse(fts: Vec<Candidate>, vec: Vec<Candidate>) -> Vec<Candidate> {
    let fts_scores = normalize(fts.iter().map(|c| c.score).collect());
    let vec_scores = normalize(vec.iter().map(|c| c.score).collect());

    let mut order: Vec<(String, usize)> = Vec::new();
    let mut merged: HashMap<(String, usize), (Candidate, f64, f64)> = HashMap::new();

    for (candidate, score) in fts.into_iter().zip(fts_scores) {
        let key = (candidate.path.clone(), candidate.start_line);
        order.push(key.clone());
        merged.insert(key, (candidate, score, 0.0));
    }
    for (candidate, score) in vec.into_iter().zip(vec_scores) {
        let key = (candidate.path.clone(), candidate.start_line);
        match merged.get_mut(&key) {
            Some(entry) => entry.2 = score,
            None => {
                order.push(key.clone());
                merged.insert(key, (candidate, 0.0, score));
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .map(|(mut candidate, fts_score, vec_score)| {
            candidate.score = 0.5 * fts_score + 0.5 * vec_score;
            candidate
        })
        .collect()
}

/// Min-max normalization; a single element (or a degenerate range) maps to 1.0.
fn normalize(scores: Vec<f64>) -> Vec<f64> {
    if scores.is_empty() {
        return scores;
    }
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if scores.len() == 1 || (max - min).abs() < f64::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

fn sort_by_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

// ── Substring fallback ────────────────────────────────────────────────────────

/// Last resort: `LIKE %query%` over chunk text, newest chunks first, scored
/// by descending position `1 / (1 + i)`.
fn substring_scan(
    conn: &Connection,
    query: &str,
    limit: usize,
    min_score: f64,
    allowed: Option<&HashSet<String>>,
) -> Result<Vec<Candidate>> {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let pattern = format!("%{escaped}%");

    let mut stmt = conn.prepare(
        "SELECT path, source, start_line, end_line, text FROM chunks \
         WHERE text LIKE ?1 ESCAPE '\\' ORDER BY updated_at DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![pattern, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter(|(path, ..)| admit(allowed, path))
        .enumerate()
        .map(|(i, (path, source, start, end, text))| Candidate {
            path,
            source,
            start_line: start as usize,
            end_line: end as usize,
            text,
            score: 1.0 / (1.0 + i as f64),
        })
        .filter(|c| c.score >= min_score)
        .collect())
}

// ── Access boost ──────────────────────────────────────────────────────────────

/// Bump `access_count` for every returned chunk in one transaction, then
/// fold usage into the score: `0.85·score + 0.15·min(1, log2(1+count)/10)`.
/// Applied identically on every retrieval path, the substring scan included.
fn boost_by_access(conn: &mut Connection, candidates: &mut Vec<Candidate>) -> Result<()> {
    if candidates.is_empty() {
        return Ok(());
    }

    let mut counts = Vec::with_capacity(candidates.len());
    let tx = conn.transaction()?;
    {
        let mut bump = tx.prepare(
            "UPDATE chunks SET access_count = access_count + 1 \
             WHERE path = ?1 AND start_line = ?2",
        )?;
        let mut read = tx.prepare(
            "SELECT MAX(access_count) FROM chunks WHERE path = ?1 AND start_line = ?2",
        )?;
        for candidate in candidates.iter() {
            bump.execute(params![candidate.path, candidate.start_line as i64])?;
            let count: i64 = read.query_row(
                params![candidate.path, candidate.start_line as i64],
                |row| Ok(row.get::<_, Option<i64>>(0)?.unwrap_or(0)),
            )?;
            counts.push(count);
        }
    }
    tx.commit()?;

    for (candidate, count) in candidates.iter_mut().zip(counts) {
        if count > 0 {
            let usage = ((1.0 + count as f64).log2() / 10.0).min(1.0);
            candidate.score = 0.85 * candidate.score + 0.15 * usage;
        }
    }
    sort_by_score(candidates);
    Ok(())
}

/// Truncate to a character budget on a char boundary. No ellipsis: the line
/// range lets callers fetch the full text via `memory_get`.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
