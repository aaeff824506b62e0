//! MCP `memory_get` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_get` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemoryGetParams {
    /// Workspace-relative path: a top-level memory file or something under `memory/`.
    #[schemars(
        description = "Workspace-relative path: a top-level memory file (MEMORY.md etc.) or a path under memory/."
    )]
    pub path: String,

    /// 1-based first line to return. Defaults to the start of the file.
    #[schemars(description = "1-based first line to return. Defaults to the start of the file.")]
    pub from: Option<usize>,

    /// Number of lines to return. Defaults to the rest of the file.
    #[schemars(description = "Number of lines to return. Defaults to the rest of the file.")]
    pub lines: Option<usize>,
}
