//! Structured mutation of the human-readable fact ledger.
//!
//! Facts live as `- ` bulleted entries in per-category markdown files under
//! `memory/`. An entry optionally carries an evidence link, a source marker,
//! and a timestamp:
//!
//! ```text
//! - prefers dark mode [ref:memory/evidence/ab12cd34ef56.md] _(source: settings)_ — 2026-08-02 10:30:00 UTC
//! ```
//!
//! Writes run through two duplicate gates: exact normalized-content match
//! inside the target category file, then a semantic pass over the search
//! index. Forget and update locate entries by normalized containment first
//! and fall back to index search scoped to the matched chunk's line range.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

use crate::chunk::sha256_hex;
use crate::embedding::LazyEmbedder;
use crate::search::{self, SearchOptions};
use crate::segment;

/// Outcome of `memory_write`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similar_entry: Option<String>,
}

/// Outcome of `memory_forget`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgetOutcome {
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of `memory_update`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Entry grammar ─────────────────────────────────────────────────────────────

/// A parsed `- ` ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub content: String,
    pub evidence: Option<String>,
    pub source: Option<String>,
}

/// Parse one ledger line, stripping the trailing markers right to left:
/// timestamp, source, evidence ref.
pub fn parse_entry(line: &str) -> Option<Entry> {
    let rest = line.strip_prefix("- ")?;
    let mut rest = rest.trim_end();

    if let Some(i) = rest.rfind(" — ") {
        if looks_like_timestamp(rest[i..].trim_start_matches(" — ")) {
            rest = rest[..i].trim_end();
        }
    }

    let mut source = None;
    if rest.ends_with(")_") {
        if let Some(i) = rest.rfind("_(source: ") {
            source = Some(rest[i + "_(source: ".len()..rest.len() - 2].to_string());
            rest = rest[..i].trim_end();
        }
    }

    let mut evidence = None;
    if rest.ends_with(']') {
        if let Some(i) = rest.rfind("[ref:") {
            evidence = Some(rest[i + "[ref:".len()..rest.len() - 1].to_string());
            rest = rest[..i].trim_end();
        }
    }

    if rest.is_empty() {
        return None;
    }
    Some(Entry {
        content: rest.to_string(),
        evidence,
        source,
    })
}

/// `YYYY-MM-DD HH:MM:SS UTC`
fn looks_like_timestamp(s: &str) -> bool {
    chrono::NaiveDateTime::parse_from_str(s.trim_end_matches(" UTC"), "%Y-%m-%d %H:%M:%S").is_ok()
        && s.ends_with(" UTC")
}

/// Render a freshly timestamped ledger line.
pub fn format_entry(content: &str, evidence: Option<&str>, source: Option<&str>) -> String {
    let mut line = format!("- {content}");
    if let Some(evidence) = evidence {
        line.push_str(&format!(" [ref:{evidence}]"));
    }
    if let Some(source) = source {
        line.push_str(&format!(" _(source: {source})_"));
    }
    let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    line.push_str(&format!(" — {stamp}"));
    line
}

/// Sanitize a category name down to `[a-z0-9_-]`; empty falls back to `general`.
pub fn sanitize_category(raw: Option<&str>) -> String {
    let cleaned: String = raw
        .unwrap_or("general")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        .collect();
    if cleaned.is_empty() {
        "general".to_string()
    } else {
        cleaned
    }
}

/// Lowercase with whitespace collapsed to single spaces.
fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Alphanumeric/CJK tokens of length ≥ 2, lowercased.
fn content_words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && !segment::is_cjk(c))
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// Share of the input's content words present in `candidate`.
fn word_overlap(candidate: &str, input_words: &HashSet<String>) -> f64 {
    if input_words.is_empty() {
        return 0.0;
    }
    let candidate_words = content_words(candidate);
    let shared = input_words.intersection(&candidate_words).count();
    shared as f64 / input_words.len() as f64
}

// ── Write ─────────────────────────────────────────────────────────────────────

pub struct WriteRequest<'a> {
    pub content: &'a str,
    pub category: Option<&'a str>,
    pub source: Option<&'a str>,
    pub evidence: Option<&'a str>,
}

/// Append a fact to its category ledger, unless a duplicate gate trips.
pub fn write_fact(
    conn: &mut Connection,
    embedder: &LazyEmbedder,
    workspace: &Path,
    request: &WriteRequest<'_>,
    token_max: usize,
) -> Result<WriteOutcome> {
    let category = sanitize_category(request.category);
    let rel_path = format!("memory/{category}.md");
    let abs_path = workspace.join(&rel_path);

    // Gate 1: exact normalized duplicate inside the category file
    let normalized = normalize(request.content);
    if let Ok(existing) = std::fs::read_to_string(&abs_path) {
        for line in existing.lines() {
            if let Some(entry) = parse_entry(line) {
                if normalize(&entry.content) == normalized {
                    return Ok(WriteOutcome {
                        stored: false,
                        path: Some(rel_path),
                        fact: None,
                        evidence_path: None,
                        reason: Some("duplicate".into()),
                        similar_entry: Some(entry.content),
                    });
                }
            }
        }
    }

    // Gate 2: semantic near-duplicate anywhere in the memory source
    if let Some((similar, path)) =
        find_semantic_duplicate(conn, embedder, request.content, token_max)?
    {
        return Ok(WriteOutcome {
            stored: false,
            path: Some(path),
            fact: None,
            evidence_path: None,
            reason: Some("semantic_duplicate".into()),
            similar_entry: Some(similar),
        });
    }

    let evidence_path = request
        .evidence
        .map(|evidence| write_evidence(workspace, request.content, evidence))
        .transpose()?;

    let line = format_entry(request.content, evidence_path.as_deref(), request.source);
    append_entry(&abs_path, &category, &line)?;

    Ok(WriteOutcome {
        stored: true,
        path: Some(rel_path),
        fact: Some(request.content.to_string()),
        evidence_path,
        reason: None,
        similar_entry: None,
    })
}

/// Search the index for a memory-source chunk whose snippet carries a line
/// with ≥ 50 % content-word overlap with the input, scored above 0.6.
fn find_semantic_duplicate(
    conn: &mut Connection,
    embedder: &LazyEmbedder,
    content: &str,
    token_max: usize,
) -> Result<Option<(String, String)>> {
    let options = SearchOptions {
        max_results: Some(3),
        min_score: Some(0.3),
        ..Default::default()
    };
    let hits = search::search(conn, embedder, content, &options, token_max)?;
    let input_words = content_words(content);

    for hit in hits {
        if hit.source != "memory" || hit.score <= 0.6 {
            continue;
        }
        for line in hit.snippet.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if word_overlap(line, &input_words) >= 0.5 {
                return Ok(Some((line.trim().to_string(), hit.path)));
            }
        }
    }
    Ok(None)
}

/// Write `memory/evidence/<factId>.md` and return its relative path.
fn write_evidence(workspace: &Path, content: &str, evidence: &str) -> Result<String> {
    let fact_id = &sha256_hex(content)[..12];
    let rel = format!("memory/evidence/{fact_id}.md");
    let abs = workspace.join(&rel);
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&abs, format!("# Evidence for: {content}\n\n{evidence}\n"))
        .with_context(|| format!("failed to write {}", abs.display()))?;
    Ok(rel)
}

fn append_entry(abs_path: &Path, category: &str, line: &str) -> Result<()> {
    if let Some(parent) = abs_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut body = match std::fs::read_to_string(abs_path) {
        Ok(existing) => existing,
        Err(_) => format!("# {}\n\n", capitalize(category)),
    };
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(line);
    body.push('\n');
    std::fs::write(abs_path, body)
        .with_context(|| format!("failed to write {}", abs_path.display()))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ── Locate ────────────────────────────────────────────────────────────────────

struct Located {
    rel_path: String,
    line_index: usize,
    entry: Entry,
}

/// Find the ledger entry matching `query`: normalized equality or mutual
/// containment across category files first, then a search-index fallback
/// scoped to the matched chunk's line range.
fn locate_entry(
    conn: &mut Connection,
    embedder: &LazyEmbedder,
    workspace: &Path,
    query: &str,
    category: Option<&str>,
    token_max: usize,
) -> Result<Option<Located>> {
    let normalized = normalize(query);

    for rel_path in ledger_files(workspace, category) {
        let abs = workspace.join(&rel_path);
        let Ok(body) = std::fs::read_to_string(&abs) else {
            continue;
        };
        for (i, line) in body.lines().enumerate() {
            let Some(entry) = parse_entry(line) else {
                continue;
            };
            let entry_norm = normalize(&entry.content);
            if entry_norm == normalized
                || entry_norm.contains(&normalized)
                || normalized.contains(&entry_norm)
            {
                return Ok(Some(Located {
                    rel_path,
                    line_index: i,
                    entry,
                }));
            }
        }
    }

    // Fallback: let the index point at the right chunk, then pick the best
    // entry inside that chunk's line range by word overlap.
    let options = SearchOptions {
        max_results: Some(5),
        min_score: Some(0.3),
        ..Default::default()
    };
    let hits = search::search(conn, embedder, query, &options, token_max)?;
    let query_words = content_words(query);

    for hit in hits {
        if hit.source != "memory" {
            continue;
        }
        let abs = workspace.join(&hit.path);
        let Ok(body) = std::fs::read_to_string(&abs) else {
            continue;
        };
        let lines: Vec<&str> = body.lines().collect();

        let mut best: Option<(usize, Entry, usize)> = None;
        for i in (hit.start_line - 1)..hit.end_line.min(lines.len()) {
            let Some(entry) = parse_entry(lines[i]) else {
                continue;
            };
            let shared = content_words(&entry.content)
                .intersection(&query_words)
                .count();
            if shared > 0 && best.as_ref().map(|(_, _, s)| shared > *s).unwrap_or(true) {
                best = Some((i, entry, shared));
            }
        }
        if let Some((line_index, entry, _)) = best {
            return Ok(Some(Located {
                rel_path: hit.path,
                line_index,
                entry,
            }));
        }
    }

    Ok(None)
}

/// Ledger files to scan: the sanitized category's file, or every `.md`
/// directly under `memory/` when no category was given.
fn ledger_files(workspace: &Path, category: Option<&str>) -> Vec<String> {
    if let Some(category) = category {
        return vec![format!("memory/{}.md", sanitize_category(Some(category)))];
    }

    let dir = workspace.join("memory");
    let Ok(read_dir) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut files: Vec<String> = read_dir
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.ends_with(".md").then(|| format!("memory/{name}"))
        })
        .collect();
    files.sort();
    files
}

fn remove_evidence_file(workspace: &Path, entry: &Entry) {
    if let Some(ref rel) = entry.evidence {
        let abs = workspace.join(rel);
        if let Err(e) = std::fs::remove_file(&abs) {
            tracing::debug!(path = %abs.display(), error = %e, "evidence file not removed");
        }
    }
}

fn rewrite_lines(abs: &Path, lines: &[String]) -> Result<()> {
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(abs, body).with_context(|| format!("failed to write {}", abs.display()))
}

// ── Forget ────────────────────────────────────────────────────────────────────

/// Remove the ledger entry matching `query`, and its evidence file if any.
pub fn forget_fact(
    conn: &mut Connection,
    embedder: &LazyEmbedder,
    workspace: &Path,
    query: &str,
    category: Option<&str>,
    token_max: usize,
) -> Result<ForgetOutcome> {
    let Some(located) =
        locate_entry(conn, embedder, workspace, query, category, token_max)?
    else {
        return Ok(ForgetOutcome {
            removed: false,
            path: None,
            removed_content: None,
            reason: Some("not_found".into()),
        });
    };

    let abs = workspace.join(&located.rel_path);
    let body = std::fs::read_to_string(&abs)
        .with_context(|| format!("failed to read {}", abs.display()))?;
    let mut lines: Vec<String> = body.lines().map(str::to_string).collect();
    lines.remove(located.line_index);
    rewrite_lines(&abs, &lines)?;

    remove_evidence_file(workspace, &located.entry);

    Ok(ForgetOutcome {
        removed: true,
        path: Some(located.rel_path),
        removed_content: Some(located.entry.content),
        reason: None,
    })
}

// ── Update ────────────────────────────────────────────────────────────────────

pub struct UpdateRequest<'a> {
    pub old_content: &'a str,
    pub new_content: &'a str,
    pub category: Option<&'a str>,
    pub source: Option<&'a str>,
    pub evidence: Option<&'a str>,
}

/// Replace a ledger entry in place with a freshly timestamped one.
pub fn update_fact(
    conn: &mut Connection,
    embedder: &LazyEmbedder,
    workspace: &Path,
    request: &UpdateRequest<'_>,
    token_max: usize,
) -> Result<UpdateOutcome> {
    let Some(located) = locate_entry(
        conn,
        embedder,
        workspace,
        request.old_content,
        request.category,
        token_max,
    )?
    else {
        return Ok(UpdateOutcome {
            updated: false,
            path: None,
            old: None,
            new: None,
            evidence_path: None,
            reason: Some("not_found".into()),
        });
    };

    remove_evidence_file(workspace, &located.entry);
    let evidence_path = request
        .evidence
        .map(|evidence| write_evidence(workspace, request.new_content, evidence))
        .transpose()?;

    let abs = workspace.join(&located.rel_path);
    let body = std::fs::read_to_string(&abs)
        .with_context(|| format!("failed to read {}", abs.display()))?;
    let mut lines: Vec<String> = body.lines().map(str::to_string).collect();
    lines[located.line_index] = format_entry(
        request.new_content,
        evidence_path.as_deref(),
        request.source,
    );
    rewrite_lines(&abs, &lines)?;

    Ok(UpdateOutcome {
        updated: true,
        path: Some(located.rel_path),
        old: Some(located.entry.content),
        new: Some(request.new_content.to_string()),
        evidence_path,
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::db::open_memory_database;
    use tempfile::TempDir;

    fn offline_embedder() -> LazyEmbedder {
        LazyEmbedder::new(EmbeddingConfig {
            model: "all-mpnet-base-v2".into(),
            cache_dir: "/nonexistent/mnemo-models".into(),
        })
    }

    fn request(content: &str) -> WriteRequest<'_> {
        WriteRequest {
            content,
            category: None,
            source: None,
            evidence: None,
        }
    }

    #[test]
    fn entry_round_trip() {
        let line = format_entry(
            "prefers dark mode",
            Some("memory/evidence/ab12.md"),
            Some("settings"),
        );
        let entry = parse_entry(&line).unwrap();
        assert_eq!(entry.content, "prefers dark mode");
        assert_eq!(entry.evidence.as_deref(), Some("memory/evidence/ab12.md"));
        assert_eq!(entry.source.as_deref(), Some("settings"));
    }

    #[test]
    fn entry_parses_bare_content() {
        let entry = parse_entry("- just a fact").unwrap();
        assert_eq!(entry.content, "just a fact");
        assert!(entry.evidence.is_none());
        assert!(entry.source.is_none());
    }

    #[test]
    fn non_entries_are_ignored() {
        assert!(parse_entry("# Heading").is_none());
        assert!(parse_entry("").is_none());
        assert!(parse_entry("-no space").is_none());
    }

    #[test]
    fn em_dash_in_content_is_preserved() {
        let entry = parse_entry("- pipeline A — stage two — needs review").unwrap();
        // No trailing timestamp, so the dashes stay in the content
        assert_eq!(entry.content, "pipeline A — stage two — needs review");
    }

    #[test]
    fn category_sanitization() {
        assert_eq!(sanitize_category(None), "general");
        assert_eq!(sanitize_category(Some("Work Notes!")), "worknotes");
        assert_eq!(sanitize_category(Some("dev-env_2")), "dev-env_2");
        assert_eq!(sanitize_category(Some("???")), "general");
    }

    #[test]
    fn write_creates_file_with_header() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_memory_database(512).unwrap();

        let outcome = write_fact(
            &mut conn,
            &offline_embedder(),
            dir.path(),
            &request("user prefers tabs"),
            4096,
        )
        .unwrap();
        assert!(outcome.stored);
        assert_eq!(outcome.path.as_deref(), Some("memory/general.md"));

        let body = std::fs::read_to_string(dir.path().join("memory/general.md")).unwrap();
        assert!(body.starts_with("# General\n\n"));
        assert!(body.contains("- user prefers tabs"));
    }

    #[test]
    fn exact_duplicate_rejected() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_memory_database(512).unwrap();
        let embedder = offline_embedder();

        write_fact(&mut conn, &embedder, dir.path(), &request("User Prefers Tabs"), 4096).unwrap();
        let outcome = write_fact(
            &mut conn,
            &embedder,
            dir.path(),
            &request("user  prefers   tabs"),
            4096,
        )
        .unwrap();
        assert!(!outcome.stored);
        assert_eq!(outcome.reason.as_deref(), Some("duplicate"));
    }

    #[test]
    fn evidence_file_written_and_linked() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_memory_database(512).unwrap();

        let outcome = write_fact(
            &mut conn,
            &offline_embedder(),
            dir.path(),
            &WriteRequest {
                content: "service X times out after 30s",
                category: Some("infra"),
                source: Some("incident"),
                evidence: Some("log excerpt here"),
            },
            4096,
        )
        .unwrap();
        assert!(outcome.stored);

        let evidence_rel = outcome.evidence_path.unwrap();
        assert!(evidence_rel.starts_with("memory/evidence/"));
        let evidence = std::fs::read_to_string(dir.path().join(&evidence_rel)).unwrap();
        assert!(evidence.starts_with("# Evidence for: service X times out after 30s\n\n"));
        assert!(evidence.contains("log excerpt here"));

        let ledger = std::fs::read_to_string(dir.path().join("memory/infra.md")).unwrap();
        assert!(ledger.contains(&format!("[ref:{evidence_rel}]")));
        assert!(ledger.contains("_(source: incident)_"));
    }

    #[test]
    fn forget_removes_line_and_evidence() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_memory_database(512).unwrap();
        let embedder = offline_embedder();

        let outcome = write_fact(
            &mut conn,
            &embedder,
            dir.path(),
            &WriteRequest {
                content: "temporary workaround for bug 42",
                category: None,
                source: None,
                evidence: Some("details"),
            },
            4096,
        )
        .unwrap();
        let evidence_rel = outcome.evidence_path.unwrap();

        let result = forget_fact(
            &mut conn,
            &embedder,
            dir.path(),
            "workaround for bug 42",
            None,
            4096,
        )
        .unwrap();
        assert!(result.removed);
        assert_eq!(
            result.removed_content.as_deref(),
            Some("temporary workaround for bug 42")
        );

        let body = std::fs::read_to_string(dir.path().join("memory/general.md")).unwrap();
        assert!(!body.contains("bug 42"));
        assert!(!dir.path().join(evidence_rel).exists());
    }

    #[test]
    fn forget_unknown_fact_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_memory_database(512).unwrap();

        let result = forget_fact(
            &mut conn,
            &offline_embedder(),
            dir.path(),
            "never stored",
            None,
            4096,
        )
        .unwrap();
        assert!(!result.removed);
        assert_eq!(result.reason.as_deref(), Some("not_found"));
    }

    #[test]
    fn update_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_memory_database(512).unwrap();
        let embedder = offline_embedder();

        write_fact(&mut conn, &embedder, dir.path(), &request("deploys run on fridays"), 4096)
            .unwrap();
        write_fact(&mut conn, &embedder, dir.path(), &request("lunch is at noon"), 4096).unwrap();

        let outcome = update_fact(
            &mut conn,
            &embedder,
            dir.path(),
            &UpdateRequest {
                old_content: "deploys run on fridays",
                new_content: "deploys run on tuesdays",
                category: None,
                source: None,
                evidence: None,
            },
            4096,
        )
        .unwrap();
        assert!(outcome.updated);
        assert_eq!(outcome.old.as_deref(), Some("deploys run on fridays"));

        let body = std::fs::read_to_string(dir.path().join("memory/general.md")).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        // Replacement happened at the original index, second entry untouched
        assert!(lines[2].contains("deploys run on tuesdays"));
        assert!(lines[3].contains("lunch is at noon"));
    }

    #[test]
    fn word_overlap_ratio() {
        let input = content_words("user prefers dark mode");
        assert!(word_overlap("user likes dark mode", &input) >= 0.5);
        assert!(word_overlap("completely unrelated sentence", &input) < 0.5);
    }
}
