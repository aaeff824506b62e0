//! MCP `memory_write` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_write` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemoryWriteParams {
    /// The fact to remember, as one short sentence.
    #[schemars(description = "The fact to remember, as one short sentence.")]
    pub content: String,

    /// Ledger category (letters, digits, `_`, `-`). Defaults to `general`.
    #[schemars(
        description = "Ledger category (letters, digits, underscore, dash). Defaults to 'general'."
    )]
    pub category: Option<String>,

    /// Where the fact came from (e.g. a tool name or conversation).
    #[schemars(description = "Where the fact came from (e.g. a tool name or conversation).")]
    pub source: Option<String>,

    /// Supporting material stored alongside the fact as an evidence file.
    #[schemars(description = "Supporting material stored alongside the fact as an evidence file.")]
    pub evidence: Option<String>,
}
