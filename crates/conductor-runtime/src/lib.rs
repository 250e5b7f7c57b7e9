//! # Conductor Runtime
//!
//! Caller-facing layer of the Conductor request orchestrator.
//!
//! This crate provides:
//! - `Orchestrator` with `submit`, `respond` and `cancel`
//! - Per-session admission (`supersede` or `queue`)
//! - Proposal expiry
//! - Bootstrap from a single `conductor.yaml`

pub mod bootstrap;
pub mod concurrency;
pub mod orchestrator;

pub use bootstrap::{
    bind_handlers, build_orchestrator, descriptor_from_spec, gate_config, init_tracing_if_needed,
    registry_from_config, resolver_config, BootstrapError, RuntimeApp,
};
pub use concurrency::{
    ConcurrencyDecision, ConcurrencyPolicy, LaneState, QueuePolicy, SessionPolicy,
    SupersedePolicy,
};
pub use orchestrator::{
    CancelOutcome, Orchestrator, OrchestratorConfig, OrchestratorError, Reply, RespondRequest,
    SubmitRequest,
};
