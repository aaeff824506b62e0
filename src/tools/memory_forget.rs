//! MCP `memory_forget` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_forget` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemoryForgetParams {
    /// Fact to remove (exact or approximate wording).
    #[schemars(description = "Fact to remove (exact or approximate wording).")]
    pub content: String,

    /// Restrict the lookup to one ledger category.
    #[schemars(description = "Restrict the lookup to one ledger category.")]
    pub category: Option<String>,
}
