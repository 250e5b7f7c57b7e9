//! Core type definitions for Conductor
//!
//! This module contains the fundamental types used throughout the system:
//! - Intent: resolved invocations and dependency edges
//! - Plan: DAG of steps with the plan state machine
//! - Step: one capability invocation with its status
//! - Proposal: confirmation request for gated steps
//! - Result: per-step outcomes collected into a plan result
//! - Session: conversation history and the parked pending plan

mod intent;
mod plan;
mod proposal;
mod result;
mod session;
mod step;

pub use intent::{DependencyEdge, Invocation, ResolutionSource, ResolvedIntent};
pub use plan::{ExecutionPlan, PlanId, PlanState, SessionId};
pub use proposal::{Decision, Proposal, ProposalItem};
pub use result::{PlanResult, SkipReason, StepOutcome, StepResult};
pub use session::{
    ContextHint, ConversationEntry, ConversationSnippet, EntryRole, PendingPlan, Session,
};
pub use step::{ConfirmationMode, ExecutionStep, ParamBinding, StepId, StepStatus};
