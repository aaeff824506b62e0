//! Local memory for coding-assistant CLIs — index, search, remember.
//!
//! mnemo is an [MCP](https://modelcontextprotocol.io/) server that gives a
//! host CLI durable, searchable memory. It watches a small workspace of
//! memory notes plus the host's session transcripts, keeps them indexed in
//! SQLite, and answers natural-language queries with hybrid retrieval:
//!
//! - **Storage**: SQLite with FTS5 for BM25 keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Embeddings**: Local ONNX Runtime with all-mpnet-base-v2 (768 dimensions),
//!   loaded lazily; search degrades gracefully when the model is absent
//! - **Search**: score-normalized weighted fusion of the lexical and vector
//!   paths, with a substring scan as the last resort
//! - **Transport**: MCP over stdio
//!
//! # Modules
//!
//! - [`config`] — Configuration from an optional TOML file plus `MEMORY_*` env vars
//! - [`db`] — SQLite schema, capability probes, and the atomic rebuild dance
//! - [`embedding`] — Text-to-vector pipeline via ONNX Runtime
//! - [`segment`] — CJK-aware tokenization for the lexical index
//! - [`chunk`] — Format-aware splitting of files into line-bounded chunks
//! - [`scan`] — Enumeration of memory files and session transcripts
//! - [`sync`] — Incremental reconciliation of the file tree into the index
//! - [`search`] — Hybrid lexical + vector retrieval
//! - [`ledger`] — Structured mutation of the human-readable fact ledger
//! - [`status`] — Index statistics and health warnings

pub mod chunk;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ledger;
pub mod scan;
pub mod search;
pub mod segment;
pub mod server;
pub mod status;
pub mod sync;
pub mod tools;
