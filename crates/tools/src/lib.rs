//! Built-in tool implementations for StreamWeave.
//!
//! Tools let the model look things up mid-generation: the current time in
//! any zone, and entries from the knowledge base.

pub mod datetime;
pub mod knowledge;

use std::sync::Arc;
use streamweave_core::store::KnowledgeSource;
use streamweave_core::tool::ToolRegistry;

pub use datetime::DateTimeTool;
pub use knowledge::KnowledgeTool;

/// Create a registry holding every built-in tool.
pub fn default_registry(knowledge: Arc<dyn KnowledgeSource>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(DateTimeTool));
    registry.register(Box::new(KnowledgeTool::new(knowledge)));
    registry
}
