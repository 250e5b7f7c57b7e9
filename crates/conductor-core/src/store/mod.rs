//! Store module
//!
//! This module provides storage abstractions:
//! - SessionStore: conversation history and the parked pending plan
//! - ContextSource: recent conversation context for ambiguous utterances
//!
//! Note: Implementations are in conductor-stores crate

mod context_source;
mod session_store;

pub use context_source::ContextSource;
pub use session_store::SessionStore;

use thiserror::Error;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("internal error: {0}")]
    Internal(String),
}
