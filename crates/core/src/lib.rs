//! # StreamWeave Core
//!
//! Domain types, traits, and error definitions for the StreamWeave chat
//! completion backend. Every collaborator the generation pipeline talks to
//! (model providers, tools, persistence, knowledge) is a trait here;
//! implementations live in their own crates.

pub mod error;
pub mod message;
pub mod provider;
pub mod channel;
pub mod tool;
pub mod store;
pub mod generation;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{BufferError, Error, ProviderError, Result, StoreError, ToolError};
pub use message::{FunctionCall, Message, MessageToolCall, Role};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta,
    ToolDefinition, Usage,
};
pub use channel::ChannelContext;
pub use tool::{Tool, ToolArguments, ToolCall, ToolOutcome, ToolRegistry};
pub use store::{
    ConversationTurn, KnowledgeEntry, KnowledgeHit, KnowledgeMatches, KnowledgeSource,
    Persistence, SessionContext,
};
pub use generation::{ChatCompletion, ChatCompletionChunk, GenerationRequest};
pub use event::{DomainEvent, EventBus};
