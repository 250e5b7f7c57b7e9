//! # Conductor Classifiers
//!
//! Model-backed intent classification for the Conductor resolver.
//!
//! This crate provides:
//! - `LlmClient` with an OpenAI-compatible HTTP implementation and a mock
//! - `LlmClassifier`, a `Classifier` that prompts with the capability catalog

mod classifier;
mod llm;

pub use classifier::{LlmClassifier, LlmClassifierConfig};
pub use llm::{HttpLlmClient, HttpLlmClientConfig, LlmClient, LlmError, LlmRequest, MockLlmClient};
