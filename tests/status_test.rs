mod helpers;

use helpers::{offline_embedder, TestWorkspace};
use mnemo::db::open_database;
use mnemo::status::memory_status;
use mnemo::sync::run_sync;
use std::sync::Mutex;

#[test]
fn run_sync_then_status_reports_counts() {
    let ws = TestWorkspace::new();
    ws.write("MEMORY.md", "# Index");
    ws.write("memory/facts.md", "- keep the build green");
    let config = ws.config();

    let mut conn = open_database(config.db_path(), config.index.chunk_size).unwrap();
    let (memory, sessions) = run_sync(&mut conn, &config, true, false, false).unwrap();
    assert_eq!(memory.indexed, 2);
    assert_eq!(sessions.indexed, 0);

    let status = memory_status(&conn, &config, &offline_embedder(), None).unwrap();
    assert_eq!(status.files, 2);
    assert_eq!(status.memory_files, 2);
    assert_eq!(status.session_files, 0);
    assert!(status.chunks >= 2);
    assert_eq!(status.embedded_chunks, 0);
    assert!(status.config.fts_available);
    assert_eq!(status.config.chunk_size, 512);
    assert!(status.warnings.is_none());
}

#[test]
fn embedding_sync_without_model_leaves_vectors_empty() {
    let ws = TestWorkspace::new();
    ws.write("memory/facts.md", "- a fact to embed");
    let config = ws.config();

    let mut conn = open_database(config.db_path(), config.index.chunk_size).unwrap();
    run_sync(&mut conn, &config, true, false, false).unwrap();

    let db = Mutex::new(conn);
    let embedder = offline_embedder();
    // No model: the loop is skipped, nothing fails, nothing is embedded
    mnemo::sync::sync_embeddings(&db, &embedder).unwrap();

    let conn = db.into_inner().unwrap();
    let status = memory_status(&conn, &config, &embedder, None).unwrap();
    assert_eq!(status.embedded_chunks, 0);
    assert!(!status.config.embedder_available);
}
