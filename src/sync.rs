//! Incremental reconciliation of scanned files into the index.
//!
//! [`sync_source`] is the single entry point for one source partition: new
//! and changed files are re-chunked and rewritten atomically (one
//! transaction per file), unchanged files are skipped by fingerprint, and
//! files that disappeared from disk are purged together with their chunks,
//! lexical entries, and vectors. [`sync_embeddings`] runs afterwards,
//! off the hot path, filling `chunks_vec` in batches through the
//! text-hash embedding cache.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::chunk::{self, Chunk};
use crate::config::MemoryConfig;
use crate::db;
use crate::embedding::{self, LazyEmbedder, EMBEDDING_DIM};
use crate::scan::{self, FileEntry, SessionLimits, SOURCE_MEMORY, SOURCE_SESSIONS};
use crate::segment;

/// Batch size for the embedding backfill loop.
const EMBED_BATCH: usize = 100;

/// Outcome of one source sync.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SyncReport {
    pub indexed: usize,
    pub skipped: usize,
    pub deleted: usize,
}

/// Reconcile `entries` (the active set for `source`) with the store.
pub fn sync_source(
    conn: &mut Connection,
    source: &str,
    entries: &[FileEntry],
    chunk_size: usize,
    force: bool,
) -> Result<SyncReport> {
    let fts = db::fts_available(conn);
    let mut report = SyncReport::default();

    for entry in entries {
        let stored_hash: Option<String> = conn
            .query_row(
                "SELECT hash FROM files WHERE path = ?1 AND source = ?2",
                params![entry.path, source],
                |row| row.get(0),
            )
            .optional()?;

        if !force && stored_hash.as_deref() == Some(entry.hash.as_str()) {
            report.skipped += 1;
            continue;
        }

        let tx = conn.transaction()?;
        reindex_file(&tx, source, entry, chunk_size, fts)
            .with_context(|| format!("failed to index {}", entry.path))?;
        tx.commit()?;
        report.indexed += 1;
    }

    report.deleted = delete_missing(conn, source, entries)?;

    tracing::info!(
        source,
        indexed = report.indexed,
        skipped = report.skipped,
        deleted = report.deleted,
        "sync complete"
    );
    Ok(report)
}

/// Rewrite one file's rows: purge old chunks, chunk the new content, insert.
///
/// Session transcripts always chunk with the sliding-window strategy, whatever
/// their extension says.
fn reindex_file(
    tx: &Transaction,
    source: &str,
    entry: &FileEntry,
    chunk_size: usize,
    fts: bool,
) -> Result<()> {
    purge_file_rows(tx, source, &entry.path)?;

    let chunks = if source == SOURCE_SESSIONS {
        chunk::chunk_markdown(&entry.content, chunk_size)
    } else {
        chunk::chunk_file(&entry.path, &entry.content, chunk_size)
    };

    tx.execute(
        "INSERT INTO files (path, source, hash, mtime, size) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(path, source) DO UPDATE SET hash = ?3, mtime = ?4, size = ?5",
        params![entry.path, source, entry.hash, entry.mtime_ms, entry.size],
    )?;

    let now = now_millis();
    for chunk in &chunks {
        insert_chunk(tx, source, &entry.path, chunk, now, fts)?;
    }
    Ok(())
}

fn insert_chunk(
    tx: &Transaction,
    source: &str,
    path: &str,
    chunk: &Chunk,
    now: i64,
    fts: bool,
) -> Result<()> {
    let id = chunk::chunk_id(source, path, chunk);
    tx.execute(
        "INSERT OR REPLACE INTO chunks \
         (id, path, source, start_line, end_line, hash, text, updated_at, access_count) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        params![
            id,
            path,
            source,
            chunk.start_line as i64,
            chunk.end_line as i64,
            chunk.hash(),
            chunk.text,
            now
        ],
    )?;

    if fts {
        tx.execute(
            "INSERT INTO chunks_fts (text, id, path, source, start_line, end_line) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                segment::segment_for_index(&chunk.text),
                id,
                path,
                source,
                chunk.start_line as i64,
                chunk.end_line as i64
            ],
        )?;
    }
    Ok(())
}

/// Delete a file's chunks, lexical entries, and vectors.
fn purge_file_rows(tx: &Transaction, source: &str, path: &str) -> Result<()> {
    let ids = chunk_ids_for_file(tx, source, path)?;
    delete_vectors(tx, &ids);

    tx.execute(
        "DELETE FROM chunks_fts WHERE path = ?1 AND source = ?2",
        params![path, source],
    )
    .or_else(|e| {
        // FTS table may be absent entirely
        tracing::debug!(error = %e, "fts delete skipped");
        Ok::<usize, rusqlite::Error>(0)
    })?;

    tx.execute(
        "DELETE FROM chunks WHERE path = ?1 AND source = ?2",
        params![path, source],
    )?;
    Ok(())
}

fn chunk_ids_for_file(conn: &Connection, source: &str, path: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT id FROM chunks WHERE path = ?1 AND source = ?2")?;
    let ids = stmt
        .query_map(params![path, source], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Remove vector rows for the given chunk ids. Prefers one `IN (...)`
/// delete, falling back to per-row deletes for vec backends that reject it.
fn delete_vectors(conn: &Connection, ids: &[String]) {
    if ids.is_empty() || !db::vec_available(conn) {
        return;
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "DELETE FROM chunks_vec WHERE id IN ({})",
        placeholders.join(", ")
    );
    let params_vec: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    if conn.execute(&sql, params_vec.as_slice()).is_err() {
        for id in ids {
            if let Err(e) = conn.execute("DELETE FROM chunks_vec WHERE id = ?1", params![id]) {
                tracing::warn!(error = %e, "vector delete failed");
            }
        }
    }
}

/// Purge stored files for `source` that are no longer in the active set.
fn delete_missing(conn: &mut Connection, source: &str, entries: &[FileEntry]) -> Result<usize> {
    let active: HashSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();

    let stored: Vec<String> = {
        let mut stmt = conn.prepare("SELECT path FROM files WHERE source = ?1")?;
        let rows = stmt
            .query_map(params![source], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        rows
    };

    let mut deleted = 0usize;
    for path in stored {
        if active.contains(path.as_str()) {
            continue;
        }
        let tx = conn.transaction()?;
        purge_file_rows(&tx, source, &path)?;
        tx.execute(
            "DELETE FROM files WHERE path = ?1 AND source = ?2",
            params![path, source],
        )?;
        tx.commit()?;
        tracing::debug!(path, source, "removed vanished file");
        deleted += 1;
    }
    Ok(deleted)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Full sync ─────────────────────────────────────────────────────────────────

/// Scan and reconcile the requested sources. Convenience wrapper used by
/// the tool layer and the `sync` CLI command.
pub fn run_sync(
    conn: &mut Connection,
    config: &MemoryConfig,
    memory: bool,
    sessions: bool,
    force: bool,
) -> Result<(SyncReport, SyncReport)> {
    let memory_report = if memory {
        let workspace = config.workspace_dir();
        let memory_entries = scan::scan_memory(&workspace);
        sync_source(conn, SOURCE_MEMORY, &memory_entries, config.index.chunk_size, force)?
    } else {
        SyncReport::default()
    };

    let session_report = if sessions {
        let limits = SessionLimits {
            days: config.index.session_days,
            max: config.index.session_max,
        };
        let session_entries = scan::scan_sessions(&config.session_roots(), &limits);
        sync_source(
            conn,
            SOURCE_SESSIONS,
            &session_entries,
            config.index.chunk_size,
            force,
        )?
    } else {
        SyncReport::default()
    };

    Ok((memory_report, session_report))
}

// ── Embedding sync ────────────────────────────────────────────────────────────

/// Backfill `chunks_vec` for chunks that have no vector yet.
///
/// Runs in batches of [`EMBED_BATCH`]: cache hits are written directly, the
/// rest goes through one `embed_batch` call. A failed batch stops the loop
/// for this cycle — no in-process retry — and keeps whatever was already
/// committed. Ends with a garbage-collection pass over the cache.
pub fn sync_embeddings(db: &Mutex<Connection>, embedder: &LazyEmbedder) -> Result<()> {
    let vec_ok = {
        let conn = lock(db)?;
        db::vec_available(&conn)
    };
    if vec_ok && embedder.available() {
        backfill_vectors(db, embedder)?;
    }

    // The cache GC compares cache rows to chunk hashes only, so it runs
    // even when the vector backend or the model is absent.
    let conn = lock(db)?;
    let removed = conn.execute(
        "DELETE FROM embedding_cache WHERE hash NOT IN (SELECT DISTINCT hash FROM chunks)",
        [],
    )?;
    if removed > 0 {
        tracing::debug!(removed, "embedding cache GC");
    }
    Ok(())
}

fn backfill_vectors(db: &Mutex<Connection>, embedder: &LazyEmbedder) -> Result<()> {
    loop {
        let pending: Vec<(String, String, String)> = {
            let conn = lock(db)?;
            let mut stmt = conn.prepare(
                "SELECT id, hash, text FROM chunks \
                 WHERE id NOT IN (SELECT id FROM chunks_vec) LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![EMBED_BATCH as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        if pending.is_empty() {
            break;
        }
        let batch_len = pending.len();

        // Partition into cache hits and texts that need the model
        let mut cached: Vec<(String, Vec<u8>)> = Vec::new();
        let mut to_embed: Vec<(String, String, String)> = Vec::new();
        {
            let conn = lock(db)?;
            for (id, hash, text) in pending {
                let hit: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT embedding FROM embedding_cache WHERE hash = ?1",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                match hit {
                    Some(blob) if blob.len() == EMBEDDING_DIM * 4 => cached.push((id, blob)),
                    _ => to_embed.push((id, hash, text)),
                }
            }
        }

        let embedded: Vec<(String, String, Vec<f32>)> = if to_embed.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<&str> = to_embed.iter().map(|(_, _, t)| t.as_str()).collect();
            match embedder.embed_batch(&texts) {
                Ok(vectors) => to_embed
                    .into_iter()
                    .zip(vectors)
                    .map(|((id, hash, _), v)| (id, hash, v))
                    .collect(),
                Err(e) => {
                    let deficit = count_missing_vectors(&lock(db)?)?;
                    tracing::warn!(
                        error = %e,
                        pending = deficit,
                        "embedding batch failed, stopping for this cycle"
                    );
                    return Ok(());
                }
            }
        };

        {
            let mut conn = lock(db)?;
            let tx = conn.transaction()?;
            let now = now_millis();
            for (id, blob) in &cached {
                insert_vector_if_live(&tx, id, blob)?;
            }
            for (id, hash, vector) in &embedded {
                anyhow::ensure!(
                    vector.len() == EMBEDDING_DIM,
                    "embedder returned {} dimensions, expected {EMBEDDING_DIM}",
                    vector.len()
                );
                let blob = embedding::vector_to_bytes(vector);
                insert_vector_if_live(&tx, id, blob)?;
                tx.execute(
                    "INSERT OR REPLACE INTO embedding_cache (hash, embedding, updated_at) \
                     VALUES (?1, ?2, ?3)",
                    params![hash, blob, now],
                )?;
            }
            tx.commit()?;
        }

        if batch_len < EMBED_BATCH {
            break;
        }
    }
    Ok(())
}

/// Insert a vector only if its chunk still exists; the chunk may have been
/// purged by a sync between the select and this transaction.
fn insert_vector_if_live(tx: &Transaction, id: &str, blob: &[u8]) -> Result<()> {
    let live: bool = tx.query_row(
        "SELECT count(*) > 0 FROM chunks WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if live {
        tx.execute(
            "INSERT OR REPLACE INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
            params![id, blob],
        )?;
    }
    Ok(())
}

fn count_missing_vectors(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT count(*) FROM chunks WHERE id NOT IN (SELECT id FROM chunks_vec)",
        [],
        |row| row.get(0),
    )?)
}

fn lock(db: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
}

// ── Debounce ──────────────────────────────────────────────────────────────────

pub const MEMORY_COOLDOWN: Duration = Duration::from_secs(5);
pub const SESSION_COOLDOWN: Duration = Duration::from_secs(60);

/// Per-source sync cooldowns. A mutation resets the memory cooldown so the
/// next tool call observes the write immediately.
#[derive(Default)]
pub struct SyncScheduler {
    last_memory: Mutex<Option<Instant>>,
    last_sessions: Mutex<Option<Instant>>,
    last_sync_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a memory sync slot; true at most once per cooldown window.
    pub fn memory_due(&self) -> bool {
        Self::claim(&self.last_memory, MEMORY_COOLDOWN)
    }

    /// Claim a session sync slot.
    pub fn sessions_due(&self) -> bool {
        Self::claim(&self.last_sessions, SESSION_COOLDOWN)
    }

    /// Forget the memory cooldown (called after mutations).
    pub fn reset_memory(&self) {
        if let Ok(mut last) = self.last_memory.lock() {
            *last = None;
        }
    }

    pub fn mark_synced(&self) {
        if let Ok(mut at) = self.last_sync_at.lock() {
            *at = Some(chrono::Utc::now());
        }
    }

    pub fn last_sync_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_sync_at.lock().ok().and_then(|at| *at)
    }

    fn claim(slot: &Mutex<Option<Instant>>, cooldown: Duration) -> bool {
        let Ok(mut last) = slot.lock() else {
            return false;
        };
        match *last {
            Some(at) if at.elapsed() < cooldown => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
