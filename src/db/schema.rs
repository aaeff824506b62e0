//! SQL DDL for the mnemo index.
//!
//! Defines the `meta`, `files`, `chunks`, `chunks_fts` (FTS5),
//! `chunks_vec` (vec0), and `embedding_cache` tables. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization; the vec0 table is
//! created separately because the extension may be unavailable.

use rusqlite::Connection;

/// The schema generation this binary expects. A mismatch on open triggers
/// a full rebuild of the index (source files on disk are never touched).
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
-- Key-value configuration (schema_version, chunk_size)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per indexed file, keyed by (path, source)
CREATE TABLE IF NOT EXISTS files (
    path TEXT NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('memory','sessions')),
    hash TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL,
    PRIMARY KEY (path, source)
);

-- Line-bounded slices of indexed files
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    source TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    hash TEXT NOT NULL,
    text TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);
CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);

-- Full-text search (BM25) over pre-segmented chunk text
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    id UNINDEXED,
    path UNINDEXED,
    source UNINDEXED,
    start_line UNINDEXED,
    end_line UNINDEXED
);

-- Embeddings keyed by chunk text hash, survives file moves and rebuilds
CREATE TABLE IF NOT EXISTS embedding_cache (
    hash TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax), and
/// its absence is a supported runtime state.
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[768] distance_metric=cosine
);
"#;

/// Initialize all schema tables and record the meta keys. Idempotent.
///
/// vec0 creation failure downgrades to a warning: the vector path is then
/// reported unavailable by [`crate::db::vec_available`].
pub fn init_schema(conn: &Connection, chunk_size: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    if let Err(e) = conn.execute_batch(VEC_TABLE_SQL) {
        tracing::warn!(error = %e, "sqlite-vec unavailable, vector search disabled");
    }

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('chunk_size', ?1)",
        [chunk_size.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 512).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"meta".to_string()));
        assert!(tables.contains(&"files".to_string()));
        assert!(tables.contains(&"chunks".to_string()));
        assert!(tables.contains(&"embedding_cache".to_string()));

        // Virtual tables respond to count queries
        let fts_count: i64 = conn
            .query_row("SELECT count(*) FROM chunks_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fts_count, 0);
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 512).unwrap();
        init_schema(&conn, 512).unwrap(); // second call should not error
    }

    #[test]
    fn meta_records_version_and_chunk_size() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 256).unwrap();

        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());

        let chunk_size: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'chunk_size'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(chunk_size, "256");
    }
}
