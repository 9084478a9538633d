//! # StreamWeave Stream Buffer
//!
//! A durable, ordered, append-only record of the chunks a generation produced,
//! keyed by generation id. Records outlive any single client connection so a
//! reader can replay from an offset or follow a generation live, and expire a
//! fixed time after their last write.
//!
//! - [`StreamStore`] is the shared store seam (list, flag, pub/sub primitives).
//! - [`InMemoryStreamStore`] implements it in-process with TTLs and broadcast.
//! - [`StreamBuffer`] is the facade the transports use.
//! - [`GenerationRegistry`] keeps one producer per generation id.

pub mod buffer;
pub mod memory;
pub mod registry;
pub mod store;

pub use buffer::{BufferOutcome, BufferSettings, ChunkStream, StreamBuffer};
pub use memory::InMemoryStreamStore;
pub use registry::{GenerationClaim, GenerationRegistry};
pub use store::{LiveEvent, Snapshot, StreamStore};
