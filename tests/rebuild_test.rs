mod helpers;

use mnemo::db::{self, get_meta, open_database};
use rusqlite::params;
use tempfile::TempDir;

#[test]
fn fresh_open_records_meta() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.db");

    let conn = open_database(&path, 512).unwrap();
    assert_eq!(
        get_meta(&conn, "schema_version").as_deref(),
        Some(&db::SCHEMA_VERSION.to_string()[..])
    );
    assert_eq!(get_meta(&conn, "chunk_size").as_deref(), Some("512"));
    assert!(db::fts_available(&conn));
}

#[test]
fn chunk_size_change_triggers_rebuild_preserving_cache() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.db");

    {
        let conn = open_database(&path, 512).unwrap();
        conn.execute(
            "INSERT INTO files (path, source, hash, mtime, size) \
             VALUES ('memory/a.md', 'memory', 'deadbeef', 0, 10)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chunks (id, path, source, start_line, end_line, hash, text, updated_at, access_count) \
             VALUES ('c1', 'memory/a.md', 'memory', 1, 1, 'h1', 'text', 0, 0)",
            [],
        )
        .unwrap();
        for i in 0..3 {
            conn.execute(
                "INSERT INTO embedding_cache (hash, embedding, updated_at) VALUES (?1, x'01020304', ?2)",
                params![format!("hash-{i}"), i],
            )
            .unwrap();
        }
    }

    let conn = open_database(&path, 1024).unwrap();

    // Derived state destroyed
    let files: i64 = conn
        .query_row("SELECT count(*) FROM files", [], |r| r.get(0))
        .unwrap();
    let chunks: i64 = conn
        .query_row("SELECT count(*) FROM chunks", [], |r| r.get(0))
        .unwrap();
    assert_eq!(files, 0);
    assert_eq!(chunks, 0);

    // Embedding cache migrated verbatim
    let cache: i64 = conn
        .query_row("SELECT count(*) FROM embedding_cache", [], |r| r.get(0))
        .unwrap();
    assert_eq!(cache, 3);

    assert_eq!(get_meta(&conn, "chunk_size").as_deref(), Some("1024"));
}

#[test]
fn rebuild_leaves_no_backup_or_temp_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.db");

    {
        open_database(&path, 512).unwrap();
    }
    {
        open_database(&path, 256).unwrap();
    }

    let leftovers: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".bak") || name.contains("rebuild"))
        .collect();
    assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");
}

#[test]
fn reopen_after_rebuild_is_stable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.db");

    {
        open_database(&path, 512).unwrap();
    }
    {
        open_database(&path, 256).unwrap();
    }
    // Same chunk size again: no rebuild, data persists
    {
        let conn = open_database(&path, 256).unwrap();
        conn.execute(
            "INSERT INTO files (path, source, hash, mtime, size) \
             VALUES ('memory/x.md', 'memory', 'h', 0, 1)",
            [],
        )
        .unwrap();
    }
    {
        let conn = open_database(&path, 256).unwrap();
        let files: i64 = conn
            .query_row("SELECT count(*) FROM files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(files, 1);
    }
}
