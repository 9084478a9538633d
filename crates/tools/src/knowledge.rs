//! Knowledge base query tool.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use streamweave_core::error::ToolError;
use streamweave_core::store::KnowledgeSource;
use streamweave_core::tool::{Tool, ToolArguments};
use tracing::warn;

const DEFAULT_TOP_K: u64 = 3;
const MAX_TOP_K: u64 = 10;
const MAX_CONTENT_CHARS: usize = 2000;

pub struct KnowledgeTool {
    source: Arc<dyn KnowledgeSource>,
}

impl KnowledgeTool {
    pub fn new(source: Arc<dyn KnowledgeSource>) -> Self {
        Self { source }
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl Tool for KnowledgeTool {
    fn name(&self) -> &str {
        "query_knowledge"
    }

    fn description(&self) -> &str {
        "Search the knowledge base for relevant information. \
         Use this when you need to answer questions about specific topics, \
         retrieve facts, or access stored knowledge documents. \
         Returns relevant knowledge entries with titles and content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query to find relevant knowledge (e.g., 'refund policy', 'API authentication')"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Maximum number of knowledge entries to return (default: 3)",
                    "minimum": 1,
                    "maximum": 10
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        let query = arguments
            .str("query")
            .ok_or_else(|| ToolError::InvalidArguments("'query' must be a string".into()))?;
        let top_k = arguments
            .u64("top_k")
            .unwrap_or(DEFAULT_TOP_K)
            .clamp(1, MAX_TOP_K) as usize;

        let matches = self.source.search(query, top_k).await.map_err(|e| {
            warn!(error = %e, "Knowledge search failed");
            ToolError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: "Failed to query knowledge base".into(),
            }
        })?;

        if matches.hits.is_empty() {
            return Ok(json!({
                "found": false,
                "query": query,
                "results": [],
                "message": "No relevant knowledge found for this query.",
            }));
        }

        let results: Vec<Value> = matches
            .hits
            .iter()
            .map(|hit| {
                json!({
                    "title": hit.entry.title,
                    "content": truncate_chars(&hit.entry.content, MAX_CONTENT_CHARS),
                    "content_type": hit.entry.content_type,
                    "relevance_score": hit.score,
                })
            })
            .collect();

        Ok(json!({
            "found": true,
            "query": query,
            "results": results,
            "total_available": matches.total,
        }))
    }
}
