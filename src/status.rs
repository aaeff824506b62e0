//! Index statistics and health warnings for `memory_status`.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::MemoryConfig;
use crate::db;
use crate::embedding::LazyEmbedder;
use crate::scan::{SOURCE_MEMORY, SOURCE_SESSIONS};

/// Response from `memory_status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub workspace_dir: String,
    pub db_path: String,
    pub files: u64,
    pub memory_files: u64,
    pub session_files: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
    pub embedding_cache: u64,
    pub config: StatusConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub chunk_size: usize,
    pub token_max: usize,
    pub session_days: u64,
    pub session_max: i64,
    pub fts_available: bool,
    pub vec_available: bool,
    pub embedder_available: bool,
}

/// How many indexed files trip the "large workspace" warning.
const FILES_WARN_THRESHOLD: u64 = 50;
/// How many chunks per file trip the "oversized file" warning.
const CHUNKS_PER_FILE_WARN_THRESHOLD: u64 = 500;

/// Aggregate index statistics and warnings.
pub fn memory_status(
    conn: &Connection,
    config: &MemoryConfig,
    embedder: &LazyEmbedder,
    last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<StatusResponse> {
    let files = count(conn, "SELECT count(*) FROM files")?;
    let memory_files = count_by_source(conn, SOURCE_MEMORY)?;
    let session_files = count_by_source(conn, SOURCE_SESSIONS)?;
    let chunks = count(conn, "SELECT count(*) FROM chunks")?;
    let vec_ok = db::vec_available(conn);
    let embedded_chunks = if vec_ok {
        count(conn, "SELECT count(*) FROM chunks_vec")?
    } else {
        0
    };
    let embedding_cache = count(conn, "SELECT count(*) FROM embedding_cache")?;

    let warnings = collect_warnings(conn, files)?;

    Ok(StatusResponse {
        workspace_dir: config.workspace_dir().to_string_lossy().into_owned(),
        db_path: config.db_path().to_string_lossy().into_owned(),
        files,
        memory_files,
        session_files,
        chunks,
        embedded_chunks,
        embedding_cache,
        config: StatusConfig {
            chunk_size: config.index.chunk_size,
            token_max: config.index.token_max,
            session_days: config.index.session_days,
            session_max: config.index.session_max,
            fts_available: db::fts_available(conn),
            vec_available: vec_ok,
            embedder_available: embedder.available(),
        },
        last_sync_at: last_sync_at.map(|at| at.to_rfc3339()),
        warnings: if warnings.is_empty() {
            None
        } else {
            Some(warnings)
        },
    })
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
}

fn count_by_source(conn: &Connection, source: &str) -> Result<u64> {
    Ok(conn.query_row(
        "SELECT count(*) FROM files WHERE source = ?1",
        params![source],
        |row| row.get::<_, i64>(0),
    )? as u64)
}

fn collect_warnings(conn: &Connection, files: u64) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    if files > FILES_WARN_THRESHOLD {
        warnings.push(format!(
            "{files} files indexed (> {FILES_WARN_THRESHOLD}); consider pruning the memory tree"
        ));
    }

    // Identical chunk text appearing under multiple paths, worst first
    let mut stmt = conn.prepare(
        "SELECT hash, COUNT(DISTINCT path) AS paths FROM chunks \
         GROUP BY hash HAVING paths >= 2 ORDER BY paths DESC LIMIT 5",
    )?;
    let duplicated = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (hash, paths) in duplicated {
        warnings.push(format!(
            "chunk {} duplicated across {paths} paths",
            &hash[..12.min(hash.len())]
        ));
    }

    let mut stmt = conn.prepare(
        "SELECT path, COUNT(*) AS chunks FROM chunks \
         GROUP BY path HAVING chunks > ?1 ORDER BY chunks DESC",
    )?;
    let oversized = stmt
        .query_map(params![CHUNKS_PER_FILE_WARN_THRESHOLD as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (path, chunks) in oversized {
        warnings.push(format!("{path} has {chunks} chunks; consider splitting it"));
    }

    Ok(warnings)
}
