//! # Conductor Core
//!
//! Core abstractions and deterministic logic for the Conductor request
//! orchestrator.
//!
//! This crate contains:
//! - Capability descriptors, parameter schemas and the registry
//! - Intent / dependency resolution (keyword classifier + identity rule)
//! - Plan building and the confirmation gate
//! - DAG execution with timeouts, retries and circuit breaking
//! - Reply synthesis
//!
//! This crate does NOT care about:
//! - How sessions are persisted
//! - Which language model classifies utterances
//! - How capability handlers talk to the outside world

pub mod capability;
pub mod executor;
pub mod planner;
pub mod resolver;
pub mod store;
pub mod synthesizer;
pub mod types;

#[cfg(test)]
mod fixtures;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::capability::{
        CancellationToken, Capability, CapabilityDescriptor, CapabilityError, CapabilityRegistry,
        CredentialSet, ExecutionContext, IdentityKind, ParamKind, ParamSpec, ParameterSchema,
    };
    pub use crate::executor::{
        BreakerConfig, ExecutionEngine, ExecutionProgressEvent, ExecutionProgressReporter,
        ExecutorContext, StopSignal,
    };
    pub use crate::planner::{GateConfig, PlanBuilder, PlanError, PlanOutcome};
    pub use crate::resolver::{
        Classification, Classifier, IntentResolver, KeywordClassifier, ResolveError,
        ResolverConfig,
    };
    pub use crate::store::{ContextSource, SessionStore, StoreError};
    pub use crate::synthesizer::{
        ReplyStatus, Synthesis, SynthesisRequest, Synthesizer, TemplateSynthesizer,
    };
    pub use crate::types::{
        Decision, ExecutionPlan, ExecutionStep, PlanResult, PlanState, Proposal, ResolvedIntent,
        SkipReason, StepId, StepResult, StepStatus,
    };
}

// Re-export key types at crate root
pub use capability::{Capability, CapabilityDescriptor, CapabilityError, CapabilityRegistry};
pub use executor::{ExecutionEngine, ExecutorContext};
pub use planner::{PlanBuilder, PlanOutcome};
pub use resolver::IntentResolver;
pub use store::{ContextSource, SessionStore, StoreError};
pub use synthesizer::{Synthesizer, TemplateSynthesizer};
pub use types::{ExecutionPlan, PlanResult, Proposal, StepId};
