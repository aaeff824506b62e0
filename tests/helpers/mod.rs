#![allow(dead_code)]

use mnemo::config::{EmbeddingConfig, MemoryConfig};
use mnemo::db;
use mnemo::embedding::LazyEmbedder;
use mnemo::scan::FileEntry;
use rusqlite::Connection;
use std::path::Path;
use tempfile::TempDir;

/// Open a fresh in-memory database with the schema applied.
pub fn test_db() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    db::schema::init_schema(&conn, 512).unwrap();
    conn
}

/// An embedder pointed at a directory with no model files: `available()` is
/// false, so search exercises the lexical and fallback paths.
pub fn offline_embedder() -> LazyEmbedder {
    LazyEmbedder::new(EmbeddingConfig {
        model: "all-mpnet-base-v2".into(),
        cache_dir: "/nonexistent/mnemo-models".into(),
    })
}

/// A scratch workspace directory with helpers for writing memory files.
pub struct TestWorkspace {
    pub dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a workspace-relative file, creating parent directories.
    pub fn write(&self, rel: &str, content: &str) {
        let abs = self.dir.path().join(rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(abs, content).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.dir.path().join(rel)).unwrap();
    }

    /// A config rooted at this workspace, with the database beside it.
    pub fn config(&self) -> MemoryConfig {
        let mut config = MemoryConfig::default();
        config.workspace.dir = Some(self.dir.path().to_string_lossy().into_owned());
        config.workspace.db_path = Some(
            self.dir
                .path()
                .join("memory.db")
                .to_string_lossy()
                .into_owned(),
        );
        config
    }
}

/// Build a [`FileEntry`] the way the scanner would, without touching disk.
pub fn entry(path: &str, content: &str) -> FileEntry {
    FileEntry {
        path: path.to_string(),
        content: content.to_string(),
        hash: mnemo::chunk::sha256_hex(content),
        mtime_ms: 1_700_000_000_000,
        size: content.len() as u64,
    }
}

/// A deterministic 768-dim unit vector with a spike at `seed`.
pub fn test_vector(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; 768];
    v[seed % 768] = 1.0;
    v
}
