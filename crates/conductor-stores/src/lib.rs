//! # Conductor Stores
//!
//! Minimal store implementations for the Conductor runtime.
//!
//! This crate provides:
//! - InMemory SessionStore (bounded history, bounded session count)
//! - SessionContextSource (recent context read back from a SessionStore)

mod context_source;
mod session_store;

pub use context_source::SessionContextSource;
pub use session_store::InMemorySessionStore;

// Re-export core traits for convenience
pub use conductor_core::store::{ContextSource, SessionStore, StoreError};
