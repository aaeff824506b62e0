//! MCP `memory_search` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_search` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemorySearchParams {
    /// Natural language or keyword query.
    #[schemars(description = "Natural language or keyword query to search memory and sessions.")]
    pub query: String,

    /// Maximum number of results (1-20). Defaults from the token budget.
    #[schemars(description = "Maximum number of results (1-20). Defaults from the token budget.")]
    pub max_results: Option<usize>,

    /// Minimum relevance score (0.0-1.0). Defaults to 0.01.
    #[schemars(description = "Minimum relevance score (0.0-1.0). Defaults to 0.01.")]
    pub min_score: Option<f64>,

    /// Token budget for the full response. Defaults to the configured MEMORY_TOKEN_MAX.
    #[schemars(
        description = "Token budget for the full response. Defaults to the configured MEMORY_TOKEN_MAX."
    )]
    pub token_max: Option<usize>,

    /// Only match files modified at or after this ISO-8601 time.
    #[schemars(description = "Only match files modified at or after this ISO-8601 time.")]
    pub after: Option<String>,

    /// Only match files modified at or before this ISO-8601 time.
    #[schemars(description = "Only match files modified at or before this ISO-8601 time.")]
    pub before: Option<String>,
}
