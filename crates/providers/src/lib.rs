//! Model provider implementations for StreamWeave.
//!
//! All providers implement the `streamweave_core::Provider` trait.
//! The router selects the correct provider for each generation.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::{ProviderRouter, build_from_config};
