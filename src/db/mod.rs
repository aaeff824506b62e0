pub mod schema;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Once;

pub use schema::SCHEMA_VERSION;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the index database at the given path.
///
/// Applies the durability pragmas, initializes the schema, and — when the
/// stored `schema_version` or `chunk_size` differs from what this process
/// expects — performs an atomic rebuild of the index. Source files on disk
/// are never touched by a rebuild; only derived state is destroyed.
pub fn open_database(path: impl AsRef<Path>, chunk_size: usize) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = open_raw(path)?;

    match stored_meta(&conn) {
        None => {
            // Fresh database
            schema::init_schema(&conn, chunk_size).context("failed to initialize schema")?;
            tracing::info!(path = %path.display(), "database initialized");
            Ok(conn)
        }
        Some((version, stored_chunk_size))
            if version != SCHEMA_VERSION || stored_chunk_size != chunk_size =>
        {
            tracing::info!(
                stored_version = version,
                stored_chunk_size = stored_chunk_size,
                chunk_size = chunk_size,
                "schema mismatch, rebuilding index"
            );
            rebuild(conn, path, chunk_size)
        }
        Some(_) => {
            // Re-run idempotent DDL so a missing vec table is retried
            schema::init_schema(&conn, chunk_size).context("failed to initialize schema")?;
            Ok(conn)
        }
    }
}

fn open_raw(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    Ok(conn)
}

/// Read `(schema_version, chunk_size)` from the meta table, or None when the
/// database is fresh (no meta table or no rows).
fn stored_meta(conn: &Connection) -> Option<(u32, usize)> {
    let version = get_meta(conn, "schema_version")?.parse().ok()?;
    let chunk_size = get_meta(conn, "chunk_size")?.parse().ok()?;
    Some((version, chunk_size))
}

pub fn get_meta(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

/// `true` when the FTS5 virtual table answers queries.
pub fn fts_available(conn: &Connection) -> bool {
    conn.query_row("SELECT count(*) FROM chunks_fts", [], |row| {
        row.get::<_, i64>(0)
    })
    .is_ok()
}

/// `true` when the vec0 virtual table answers queries.
pub fn vec_available(conn: &Connection) -> bool {
    conn.query_row("SELECT count(*) FROM chunks_vec", [], |row| {
        row.get::<_, i64>(0)
    })
    .is_ok()
}

/// Rebuild the index in a sibling file, then swap it into place.
///
/// The embedding cache is migrated into the new store before the swap so
/// re-embedding after a rebuild is cache-warm. A reader of the primary path
/// sees either the old complete store or the new complete store. On any
/// failure the original is left untouched and an in-place rebuild runs
/// instead.
fn rebuild(conn: Connection, path: &Path, chunk_size: usize) -> Result<Connection> {
    let tmp_path = sibling_path(path);

    if let Err(e) = prepare_sibling(&conn, &tmp_path, chunk_size) {
        tracing::warn!(error = %e, "sibling store creation failed, rebuilding in place");
        cleanup(&tmp_path);
        rebuild_in_place(&conn, chunk_size)?;
        return Ok(conn);
    }

    // Both handles must be closed before the rename dance; some platforms
    // reject rename-over-open-file.
    drop(conn);

    match swap_into_place(path, &tmp_path) {
        Ok(()) => {
            remove_sidecars(path);
            open_raw(path)
        }
        Err(e) => {
            tracing::warn!(error = %e, "database swap failed, rebuilding in place");
            cleanup(&tmp_path);
            let conn = open_raw(path)?;
            rebuild_in_place(&conn, chunk_size)?;
            Ok(conn)
        }
    }
}

/// Create the new store at `tmp_path` and migrate the embedding cache into
/// it (best effort).
fn prepare_sibling(conn: &Connection, tmp_path: &Path, chunk_size: usize) -> Result<()> {
    let tmp = open_raw(tmp_path)?;
    schema::init_schema(&tmp, chunk_size).context("failed to apply new schema")?;

    if let Err(e) = copy_embedding_cache(conn, &tmp) {
        tracing::warn!(error = %e, "embedding cache migration failed, continuing");
    }

    tmp.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)").ok();
    Ok(())
}

/// `primary → .bak`, `tmp → primary`, delete `.bak` and sidecars. The
/// original rolls back into place if the second rename fails.
fn swap_into_place(path: &Path, tmp_path: &Path) -> Result<()> {
    let bak_path = path.with_extension("bak");

    std::fs::rename(path, &bak_path).context("failed to move old database aside")?;
    if let Err(e) = std::fs::rename(tmp_path, path) {
        let _ = std::fs::rename(&bak_path, path);
        return Err(e).context("failed to move new database into place");
    }

    let _ = std::fs::remove_file(&bak_path);
    remove_sidecars(&bak_path);
    remove_sidecars(tmp_path);
    Ok(())
}

fn cleanup(tmp_path: &Path) {
    let _ = std::fs::remove_file(tmp_path);
    remove_sidecars(tmp_path);
}

/// Fallback rebuild: drop all derived tables and recreate the schema.
/// The embedding cache is kept in place.
fn rebuild_in_place(conn: &Connection, chunk_size: usize) -> Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS chunks_fts;\n\
         DROP TABLE IF EXISTS chunks_vec;\n\
         DROP TABLE IF EXISTS chunks;\n\
         DROP TABLE IF EXISTS files;\n\
         DROP TABLE IF EXISTS meta;",
    )
    .context("failed to drop old tables")?;
    schema::init_schema(conn, chunk_size).context("failed to recreate schema")?;
    Ok(())
}

fn copy_embedding_cache(src: &Connection, dst: &Connection) -> Result<()> {
    let mut stmt = src.prepare("SELECT hash, embedding, updated_at FROM embedding_cache")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut insert = dst.prepare(
        "INSERT OR REPLACE INTO embedding_cache (hash, embedding, updated_at) VALUES (?1, ?2, ?3)",
    )?;
    let mut copied = 0usize;
    for row in rows {
        let (hash, embedding, updated_at) = row?;
        insert.execute(rusqlite::params![hash, embedding, updated_at])?;
        copied += 1;
    }
    tracing::info!(rows = copied, "embedding cache migrated");
    Ok(())
}

/// A sibling temp path with a random-enough suffix in the same directory,
/// so the final rename never crosses filesystems.
fn sibling_path(path: &Path) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "memory.db".into());
    path.with_file_name(format!("{name}.rebuild-{}-{nanos}", std::process::id()))
}

/// Delete WAL and shared-memory sidecars for a database path, if present.
fn remove_sidecars(path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut os = path.as_os_str().to_owned();
        os.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(os));
    }
}

/// Open an in-memory database for testing.
#[cfg(test)]
pub fn open_memory_database(chunk_size: usize) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    schema::init_schema(&conn, chunk_size).context("failed to initialize schema")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_probes_on_fresh_db() {
        let conn = open_memory_database(512).unwrap();
        assert!(fts_available(&conn));
        assert!(vec_available(&conn));
    }

    #[test]
    fn probe_is_false_without_table() {
        load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        assert!(!fts_available(&conn));
        assert!(!vec_available(&conn));
    }

    #[test]
    fn reopen_same_chunk_size_preserves_data() {
        let dir = std::env::temp_dir().join(format!("mnemo-db-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let db = dir.join("memory.db");
        let _ = std::fs::remove_file(&db);

        {
            let conn = open_database(&db, 512).unwrap();
            conn.execute(
                "INSERT INTO files (path, source, hash, mtime, size) VALUES ('a.md','memory','h',0,1)",
                [],
            )
            .unwrap();
        }
        {
            let conn = open_database(&db, 512).unwrap();
            let count: i64 = conn
                .query_row("SELECT count(*) FROM files", [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 1);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn chunk_size_change_rebuilds_and_keeps_cache() {
        let dir = std::env::temp_dir().join(format!("mnemo-rebuild-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let db = dir.join("memory.db");
        let _ = std::fs::remove_file(&db);

        {
            let conn = open_database(&db, 512).unwrap();
            conn.execute(
                "INSERT INTO files (path, source, hash, mtime, size) VALUES ('a.md','memory','h',0,1)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO embedding_cache (hash, embedding, updated_at) VALUES ('abc', x'00000000', 1)",
                [],
            )
            .unwrap();
        }
        {
            let conn = open_database(&db, 256).unwrap();
            // Index state destroyed
            let files: i64 = conn
                .query_row("SELECT count(*) FROM files", [], |r| r.get(0))
                .unwrap();
            assert_eq!(files, 0);
            // Cache migrated
            let cache: i64 = conn
                .query_row("SELECT count(*) FROM embedding_cache", [], |r| r.get(0))
                .unwrap();
            assert_eq!(cache, 1);
            // New chunk size recorded
            assert_eq!(get_meta(&conn, "chunk_size").as_deref(), Some("256"));
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
