//! MCP `memory_update` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_update` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemoryUpdateParams {
    /// Existing fact to replace (exact or approximate wording).
    #[schemars(description = "Existing fact to replace (exact or approximate wording).")]
    pub old_content: String,

    /// Replacement fact.
    #[schemars(description = "Replacement fact.")]
    pub new_content: String,

    /// Restrict the lookup to one ledger category.
    #[schemars(description = "Restrict the lookup to one ledger category.")]
    pub category: Option<String>,

    /// Where the updated fact came from.
    #[schemars(description = "Where the updated fact came from.")]
    pub source: Option<String>,

    /// Replacement evidence stored alongside the updated fact.
    #[schemars(description = "Replacement evidence stored alongside the updated fact.")]
    pub evidence: Option<String>,
}
