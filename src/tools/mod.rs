pub mod memory_forget;
pub mod memory_get;
pub mod memory_search;
pub mod memory_status;
pub mod memory_update;
pub mod memory_write;

use memory_forget::MemoryForgetParams;
use memory_get::MemoryGetParams;
use memory_search::MemorySearchParams;
use memory_status::MemoryStatusParams;
use memory_update::MemoryUpdateParams;
use memory_write::MemoryWriteParams;
use rmcp::handler::server::tool::{Parameters, ToolRouter};
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use rusqlite::Connection;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::embedding::LazyEmbedder;
use crate::ledger;
use crate::scan::{self, MEMORY_FILE_NAMES};
use crate::search::{self, SearchOptions};
use crate::status;
use crate::sync::{self, SyncScheduler};

/// The mnemo MCP tool handler. Holds shared state (db connection, lazy
/// embedder, config, sync scheduler) and exposes all MCP tools via the
/// `#[tool_router]` macro.
#[derive(Clone)]
pub struct MemoryTools {
    tool_router: ToolRouter<Self>,
    db: Arc<Mutex<Connection>>,
    embedder: Arc<LazyEmbedder>,
    config: Arc<MemoryConfig>,
    scheduler: Arc<SyncScheduler>,
    embed_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

#[tool_router]
impl MemoryTools {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        embedder: Arc<LazyEmbedder>,
        config: Arc<MemoryConfig>,
    ) -> Self {
        Self {
            tool_router: Self::tool_router(),
            db,
            embedder,
            config,
            scheduler: Arc::new(SyncScheduler::new()),
            embed_task: Arc::new(Mutex::new(None)),
        }
    }

    /// The handle of the most recently spawned embedding task, for a join
    /// on shutdown.
    pub fn take_embed_task(&self) -> Option<JoinHandle<()>> {
        self.embed_task.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Search memory and session transcripts.
    #[tool(
        description = "Search memory notes and session transcripts with a natural language query. Returns ranked snippets with paths and line ranges."
    )]
    async fn memory_search(
        &self,
        Parameters(params): Parameters<MemorySearchParams>,
    ) -> Result<String, String> {
        self.debounced_sync().await;

        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let token_max = self.config.index.token_max;
        let options = SearchOptions {
            max_results: params.max_results,
            min_score: params.min_score,
            token_max: params.token_max.map(|t| {
                t.clamp(
                    crate::config::TOKEN_MAX_RANGE.0,
                    crate::config::TOKEN_MAX_RANGE.1,
                )
            }),
            after: params.after,
            before: params.before,
        };
        let query = params.query;

        let results = tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            search::search(&mut conn, &embedder, &query, &options, token_max)
        })
        .await
        .map_err(|e| format!("search task failed: {e}"))?
        .map_err(|e| {
            tracing::error!(error = %e, "search failed");
            "search failed".to_string()
        })?;

        let count = results.len();
        serde_json::to_string(&serde_json::json!({ "results": results, "count": count }))
            .map_err(|e| format!("serialization failed: {e}"))
    }

    /// Read a memory file (or a slice of it) from the workspace.
    #[tool(
        description = "Read a memory file by workspace-relative path, optionally a line range. Only memory files are accessible."
    )]
    async fn memory_get(
        &self,
        Parameters(params): Parameters<MemoryGetParams>,
    ) -> Result<String, String> {
        let workspace = self.config.workspace_dir();
        let Some(abs) = resolve_allowed_path(&workspace, &params.path) else {
            return Err(r#"{"error":"path not allowed"}"#.to_string());
        };

        let text = tokio::task::spawn_blocking(move || std::fs::read_to_string(abs))
            .await
            .map_err(|e| format!("read task failed: {e}"))?
            .map_err(|_| r#"{"error":"file not found"}"#.to_string())?;

        let text = slice_lines(&text, params.from, params.lines);
        serde_json::to_string(&serde_json::json!({ "path": params.path, "text": text }))
            .map_err(|e| format!("serialization failed: {e}"))
    }

    /// Report index statistics and configuration.
    #[tool(
        description = "Report memory index statistics: file and chunk counts, embedding coverage, configuration, and health warnings."
    )]
    async fn memory_status(
        &self,
        Parameters(_params): Parameters<MemoryStatusParams>,
    ) -> Result<String, String> {
        self.debounced_sync().await;

        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let config = Arc::clone(&self.config);
        let last_sync_at = self.scheduler.last_sync_at();

        let response = tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            status::memory_status(&conn, &config, &embedder, last_sync_at)
        })
        .await
        .map_err(|e| format!("status task failed: {e}"))?
        .map_err(|e| {
            tracing::error!(error = %e, "status failed");
            "status failed".to_string()
        })?;

        serde_json::to_string(&response).map_err(|e| format!("serialization failed: {e}"))
    }

    /// Store a fact in the memory ledger.
    #[tool(
        description = "Remember a fact. Deduplicates against existing entries, optionally stores evidence, and files the fact under a category ledger."
    )]
    async fn memory_write(
        &self,
        Parameters(params): Parameters<MemoryWriteParams>,
    ) -> Result<String, String> {
        self.debounced_sync().await;

        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let workspace = self.config.workspace_dir();
        let token_max = self.config.index.token_max;

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            ledger::write_fact(
                &mut conn,
                &embedder,
                &workspace,
                &ledger::WriteRequest {
                    content: &params.content,
                    category: params.category.as_deref(),
                    source: params.source.as_deref(),
                    evidence: params.evidence.as_deref(),
                },
                token_max,
            )
        })
        .await
        .map_err(|e| format!("write task failed: {e}"))?
        .map_err(|e| {
            tracing::error!(error = %e, "memory_write failed");
            "write failed".to_string()
        })?;

        // Next tool call resyncs immediately and sees the new fact
        self.scheduler.reset_memory();

        serde_json::to_string(&outcome).map_err(|e| format!("serialization failed: {e}"))
    }

    /// Replace a fact in the memory ledger.
    #[tool(
        description = "Update a remembered fact in place: the old entry is located by content, replaced, and its evidence swapped."
    )]
    async fn memory_update(
        &self,
        Parameters(params): Parameters<MemoryUpdateParams>,
    ) -> Result<String, String> {
        self.debounced_sync().await;

        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let workspace = self.config.workspace_dir();
        let token_max = self.config.index.token_max;

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            ledger::update_fact(
                &mut conn,
                &embedder,
                &workspace,
                &ledger::UpdateRequest {
                    old_content: &params.old_content,
                    new_content: &params.new_content,
                    category: params.category.as_deref(),
                    source: params.source.as_deref(),
                    evidence: params.evidence.as_deref(),
                },
                token_max,
            )
        })
        .await
        .map_err(|e| format!("update task failed: {e}"))?
        .map_err(|e| {
            tracing::error!(error = %e, "memory_update failed");
            "update failed".to_string()
        })?;

        self.scheduler.reset_memory();

        serde_json::to_string(&outcome).map_err(|e| format!("serialization failed: {e}"))
    }

    /// Remove a fact from the memory ledger.
    #[tool(
        description = "Forget a remembered fact. Locates the ledger entry by content and removes it together with its evidence file."
    )]
    async fn memory_forget(
        &self,
        Parameters(params): Parameters<MemoryForgetParams>,
    ) -> Result<String, String> {
        self.debounced_sync().await;

        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let workspace = self.config.workspace_dir();
        let token_max = self.config.index.token_max;

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            ledger::forget_fact(
                &mut conn,
                &embedder,
                &workspace,
                &params.content,
                params.category.as_deref(),
                token_max,
            )
        })
        .await
        .map_err(|e| format!("forget task failed: {e}"))?
        .map_err(|e| {
            tracing::error!(error = %e, "memory_forget failed");
            "forget failed".to_string()
        })?;

        self.scheduler.reset_memory();

        serde_json::to_string(&outcome).map_err(|e| format!("serialization failed: {e}"))
    }
}

impl MemoryTools {
    /// Run the debounced sync, then kick the embedding backfill into the
    /// background. Sync errors are logged, never surfaced to the tool result.
    async fn debounced_sync(&self) {
        let memory_due = self.scheduler.memory_due();
        let sessions_due = self.scheduler.sessions_due();
        if !memory_due && !sessions_due {
            return;
        }

        let db = Arc::clone(&self.db);
        let config = Arc::clone(&self.config);
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            sync::run_sync(&mut conn, &config, memory_due, sessions_due, false)
        })
        .await;

        match result {
            Ok(Ok(_)) => {
                self.scheduler.mark_synced();
                self.spawn_embedding_sync();
            }
            Ok(Err(e)) => tracing::error!(error = %e, "sync failed"),
            Err(e) => tracing::error!(error = %e, "sync task panicked"),
        }
    }

    /// Fire-and-forget embedding backfill; the handle is retained so the
    /// server can join it on shutdown.
    fn spawn_embedding_sync(&self) {
        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let handle = tokio::task::spawn_blocking(move || {
            if let Err(e) = sync::sync_embeddings(&db, &embedder) {
                tracing::warn!(error = %e, "embedding sync failed");
            }
        });
        if let Ok(mut slot) = self.embed_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                // Older task keeps running to completion; only the newest
                // handle is joined at shutdown.
                drop(previous);
            }
        }
    }
}

/// Resolve a workspace-relative path against the allow-list: the top-level
/// memory files or anything under `memory/`, with an indexed extension.
/// Absolute paths and parent traversal are rejected.
fn resolve_allowed_path(workspace: &Path, raw: &str) -> Option<PathBuf> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    let rel = parts.join("/");

    let in_allow_list =
        MEMORY_FILE_NAMES.contains(&rel.as_str()) || rel.starts_with("memory/");
    let extension_ok = Path::new(&rel)
        .extension()
        .map(|e| scan::is_indexed_extension(&e.to_string_lossy().to_lowercase()))
        .unwrap_or(false);

    (in_allow_list && extension_ok).then(|| workspace.join(rel))
}

/// Apply the optional `from`/`lines` window (1-based, inclusive start).
fn slice_lines(text: &str, from: Option<usize>, lines: Option<usize>) -> String {
    if from.is_none() && lines.is_none() {
        return text.to_string();
    }
    let start = from.unwrap_or(1).max(1) - 1;
    let take = lines.unwrap_or(usize::MAX);
    text.lines()
        .skip(start)
        .take(take)
        .collect::<Vec<_>>()
        .join("\n")
}

#[tool_handler]
impl ServerHandler for MemoryTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "mnemo is a local memory server. Use memory_search before answering questions \
                 that earlier sessions may have covered, memory_write to remember durable facts, \
                 and memory_get to read a matched file in full."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
