//! The generation pipeline for StreamWeave.
//!
//! A user turn flows through the orchestrator in a fixed shape:
//!
//! 1. **Prepare**: resolve channel and session, assemble the system prompt
//! 2. **Call the model** with the tool catalog attached
//! 3. **If tool calls**: execute them once, concurrently
//! 4. **Call the model again** without tools and deliver that answer
//! 5. **Finalize**: persist the turn and publish domain events
//!
//! There is no loop: at most two model calls per turn.

pub mod orchestrator;
pub mod prompt;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use orchestrator::{Orchestrator, OrchestratorSettings, PreparedGeneration, new_stream_id};
pub use prompt::PromptAssembler;
pub use stream_event::{ErrorKind, GenerationEvent, GenerationStage};
