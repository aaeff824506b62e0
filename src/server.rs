//! MCP server initialization for the stdio transport.
//!
//! Wires the database, lazy embedder, and tool handler together, runs the
//! server until the host disconnects, then joins the in-flight embedding
//! task so it is not torn down mid-transaction.

use crate::config::MemoryConfig;
use crate::db;
use crate::embedding::LazyEmbedder;
use crate::tools::MemoryTools;
use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::{Arc, Mutex};

/// Shared setup: open DB, build the lazy embedder. Returns state wrapped in
/// Arc for sharing across tool calls.
pub fn setup_shared_state(
    config: MemoryConfig,
) -> Result<(
    Arc<Mutex<rusqlite::Connection>>,
    Arc<LazyEmbedder>,
    Arc<MemoryConfig>,
)> {
    let db_path = config.db_path();
    let conn = db::open_database(&db_path, config.index.chunk_size)?;
    tracing::info!(
        db = %db_path.display(),
        fts = db::fts_available(&conn),
        vec = db::vec_available(&conn),
        "database ready"
    );

    let db = Arc::new(Mutex::new(conn));
    let embedder = Arc::new(LazyEmbedder::new(config.embedding.clone()));
    let config = Arc::new(config);

    Ok((db, embedder, config))
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: MemoryConfig) -> Result<()> {
    tracing::info!("starting mnemo MCP server on stdio");

    let (db, embedder, config) = setup_shared_state(config)?;

    let tools = MemoryTools::new(db, embedder, config);
    let shutdown_tools = tools.clone();
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running — waiting for client");

    server.waiting().await?;

    // Let a still-running embedding backfill finish its current batch
    if let Some(task) = shutdown_tools.take_embed_task() {
        tracing::info!("waiting for embedding sync to finish");
        let _ = task.await;
    }
    tracing::info!("MCP server shut down");

    Ok(())
}
