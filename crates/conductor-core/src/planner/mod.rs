//! Plan builder and confirmation gate
//!
//! Converts a resolved intent into an executable plan. Steps whose
//! capability requires confirmation (or mutates external state without being
//! whitelisted) are gated; they and everything downstream start `Blocked`
//! while the remaining auto steps may run immediately.

mod gate;
mod validate;

use chrono::Duration as ChronoDuration;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use gate::{confirm_plan, describe_step, terminate_plan};

use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::types::{
    ConfirmationMode, ExecutionPlan, ExecutionStep, PlanResult, PlanState, Proposal,
    ProposalItem, ResolvedIntent, SessionId, StepStatus,
};

/// Fatal plan-construction errors, reported before anything runs
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("nothing to plan")]
    EmptyPlan,

    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("step '{step}' ({capability}): {reason}")]
    InvalidParameters {
        step: String,
        capability: String,
        reason: String,
    },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on undefined step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    #[error("dependency cycle involving step '{0}'")]
    CycleDetected(String),

    #[error("illegal plan transition from {from:?} to {to:?}")]
    InvalidTransition { from: PlanState, to: PlanState },
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Mutating capabilities allowed to run without confirmation
    pub auto_approve: HashSet<String>,
    /// How long a proposal stays open
    pub confirmation_window: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            auto_approve: HashSet::new(),
            confirmation_window: Duration::from_secs(300),
        }
    }
}

/// Result of building a plan
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// No step needs confirmation
    Ready(ExecutionPlan),
    /// At least one step is gated; auto steps may run first
    NeedsConfirmation {
        plan: ExecutionPlan,
        proposal: Proposal,
    },
}

impl PlanOutcome {
    pub fn plan(&self) -> &ExecutionPlan {
        match self {
            PlanOutcome::Ready(plan) => plan,
            PlanOutcome::NeedsConfirmation { plan, .. } => plan,
        }
    }

    pub fn into_parts(self) -> (ExecutionPlan, Option<Proposal>) {
        match self {
            PlanOutcome::Ready(plan) => (plan, None),
            PlanOutcome::NeedsConfirmation { plan, proposal } => (plan, Some(proposal)),
        }
    }
}

pub struct PlanBuilder {
    registry: Arc<CapabilityRegistry>,
    /// Swapped on config reload; plans already built keep their gating
    config: RwLock<GateConfig>,
}

impl PlanBuilder {
    pub fn new(registry: Arc<CapabilityRegistry>, config: GateConfig) -> Self {
        Self {
            registry,
            config: RwLock::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn gate_config(&self) -> GateConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whitelist and window for plans built from now on
    pub fn update_gate_config(&self, config: GateConfig) {
        info!(
            auto_approve = ?config.auto_approve,
            window_secs = config.confirmation_window.as_secs(),
            "confirmation gate updated"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Gating rule, derived from descriptor properties only
    pub fn confirmation_mode(&self, descriptor: &CapabilityDescriptor) -> ConfirmationMode {
        let gated = descriptor.requires_confirmation
            || (descriptor.mutates_external_state
                && !self
                    .config
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .auto_approve
                    .contains(&descriptor.name));
        if gated {
            ConfirmationMode::NeedsConfirmation
        } else {
            ConfirmationMode::Auto
        }
    }

    pub fn build(
        &self,
        resolved: &ResolvedIntent,
        session_id: Option<&SessionId>,
    ) -> Result<PlanOutcome, PlanError> {
        let mut steps = Vec::with_capacity(resolved.invocations.len());
        for invocation in &resolved.invocations {
            let descriptor = self
                .registry
                .get(&invocation.capability)
                .ok_or_else(|| PlanError::UnknownCapability(invocation.capability.clone()))?;

            let bound: Vec<&str> = invocation
                .bindings
                .iter()
                .map(|b| b.param.as_str())
                .collect();
            descriptor
                .parameter_schema
                .validate(&invocation.raw_parameters, &bound)
                .map_err(|err| PlanError::InvalidParameters {
                    step: invocation.id.to_string(),
                    capability: invocation.capability.clone(),
                    reason: err.to_string(),
                })?;

            let parameters = if invocation.raw_parameters.is_null() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                invocation.raw_parameters.clone()
            };
            let mut step = ExecutionStep::new(invocation.id.clone(), invocation.capability.clone())
                .with_parameters(parameters)
                .with_depends_on(resolved.dependencies_of(&invocation.id))
                .with_bindings(invocation.bindings.clone())
                .with_confirmation(self.confirmation_mode(&descriptor));
            validate::derive_depends_on_from_bindings(&mut step);
            steps.push(step);
        }

        validate::validate_structure(&steps)?;

        let mut plan = ExecutionPlan::new(steps);
        if let Some(session_id) = session_id {
            plan = plan.with_session(session_id.clone());
        }

        let gated: Vec<_> = plan
            .steps
            .iter()
            .filter(|s| s.needs_confirmation())
            .map(|s| s.id.clone())
            .collect();
        if gated.is_empty() {
            debug!(plan_id = %plan.id, steps = plan.steps.len(), "plan built without gated steps");
            return Ok(PlanOutcome::Ready(plan));
        }

        let mut held: Vec<_> = gated.clone();
        for id in &gated {
            held.extend(plan.descendants_of(id.as_str()));
        }
        for id in held {
            plan.set_status(id.as_str(), StepStatus::Blocked);
        }

        let proposal = self.proposal_for(&plan, None);
        info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            gated = gated.len(),
            "plan built with confirmation gate"
        );
        Ok(PlanOutcome::NeedsConfirmation { plan, proposal })
    }

    /// Build a proposal describing the plan's open gated steps
    pub fn proposal_for(&self, plan: &ExecutionPlan, results: Option<&PlanResult>) -> Proposal {
        let window = ChronoDuration::from_std(self.gate_config().confirmation_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        Proposal::new(plan.id.clone(), self.proposal_items(plan, results), window)
    }

    /// Re-describe gated steps with the auto phase's outcome, keeping the deadline
    pub fn refresh_proposal(
        &self,
        plan: &ExecutionPlan,
        proposal: &Proposal,
        results: &PlanResult,
    ) -> Proposal {
        Proposal {
            items: self.proposal_items(plan, Some(results)),
            ..proposal.clone()
        }
    }

    fn proposal_items(&self, plan: &ExecutionPlan, results: Option<&PlanResult>) -> Vec<ProposalItem> {
        plan.open_gated_steps()
            .into_iter()
            .map(|step| ProposalItem {
                step_id: step.id.clone(),
                capability: step.capability.clone(),
                description: describe_step(&self.registry, plan, step, results),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityError;
    use crate::fixtures::sample_registry;
    use crate::types::{
        DependencyEdge, Invocation, ParamBinding, SkipReason, StepId, StepResult,
    };
    use serde_json::json;

    fn builder() -> PlanBuilder {
        PlanBuilder::new(Arc::new(sample_registry()), GateConfig::default())
    }

    fn email_john() -> ResolvedIntent {
        ResolvedIntent {
            invocations: vec![
                Invocation::new("s1", "resolve_contact", json!({"query": "John"})),
                Invocation::new("s2", "send_email", json!({"subject": "the deck"}))
                    .with_binding(ParamBinding::new("to", "s1", "email")),
            ],
            edges: vec![DependencyEdge::new("s1", "s2")],
            confidence: 0.6,
            ..ResolvedIntent::default()
        }
    }

    #[test]
    fn test_lookup_runs_auto_and_email_is_gated() {
        let (plan, proposal) = builder().build(&email_john(), None).unwrap().into_parts();
        let proposal = proposal.unwrap();

        let lookup = plan.get_step("s1").unwrap();
        assert_eq!(lookup.confirmation, ConfirmationMode::Auto);
        assert_eq!(lookup.status, StepStatus::Pending);

        let email = plan.get_step("s2").unwrap();
        assert!(email.needs_confirmation());
        assert_eq!(email.status, StepStatus::Blocked);
        assert_eq!(email.depends_on, vec![StepId::from("s1")]);

        assert_eq!(proposal.items.len(), 1);
        assert_eq!(
            proposal.items[0].description,
            "send an email (to: the email found for \"John\" via resolve_contact; subject: \"the deck\")"
        );
    }

    #[test]
    fn test_refreshed_proposal_names_lookup_outcome() {
        let builder = builder();
        let (plan, proposal) = builder.build(&email_john(), None).unwrap().into_parts();
        let proposal = proposal.unwrap();

        let mut found = PlanResult::new();
        found.insert(StepResult::succeeded(
            "s1".into(),
            "resolve_contact",
            json!({"email": "john@example.com"}),
            4,
            1,
        ));
        let refreshed = builder.refresh_proposal(&plan, &proposal, &found);
        assert_eq!(refreshed.expires_at, proposal.expires_at);
        assert!(refreshed.items[0]
            .description
            .contains("\"john@example.com\" (found for \"John\" via resolve_contact)"));

        let mut missing = PlanResult::new();
        missing.insert(StepResult::failed(
            "s1".into(),
            "resolve_contact",
            CapabilityError::validation("no match"),
            4,
            1,
        ));
        let refreshed = builder.refresh_proposal(&plan, &proposal, &missing);
        assert!(refreshed.items[0]
            .description
            .contains("no email found for \"John\" (resolve_contact failed)"));
    }

    #[test]
    fn test_read_only_plan_is_ready() {
        let resolved = ResolvedIntent {
            invocations: vec![
                Invocation::new("s1", "search_contacts", json!({"query": "Sue"})),
                Invocation::new("s2", "web_search", json!({"query": "weather"})),
            ],
            confidence: 0.6,
            ..ResolvedIntent::default()
        };
        match builder().build(&resolved, None).unwrap() {
            PlanOutcome::Ready(plan) => {
                assert!(plan
                    .steps
                    .iter()
                    .all(|s| s.confirmation == ConfirmationMode::Auto
                        && s.status == StepStatus::Pending
                        && s.depends_on.is_empty()));
            }
            other => panic!("expected ready plan, got {:?}", other),
        }
    }

    #[test]
    fn test_every_mutating_step_is_gated_unless_whitelisted() {
        let resolved = ResolvedIntent {
            invocations: vec![
                Invocation::new("s1", "send_email", json!({"to": "a@b.io", "subject": "x"})),
                Invocation::new("s2", "create_event", json!({"title": "sync"})),
            ],
            confidence: 1.0,
            ..ResolvedIntent::default()
        };
        let (plan, _) = builder().build(&resolved, None).unwrap().into_parts();
        assert!(plan.steps.iter().all(|s| s.needs_confirmation()));

        let mut config = GateConfig::default();
        config.auto_approve.insert("create_event".to_string());
        let whitelisting = PlanBuilder::new(Arc::new(sample_registry()), config);
        let (plan, _) = whitelisting.build(&resolved, None).unwrap().into_parts();
        assert!(plan.get_step("s1").unwrap().needs_confirmation());
        assert_eq!(
            plan.get_step("s2").unwrap().confirmation,
            ConfirmationMode::Auto
        );
    }

    #[test]
    fn test_updated_gate_config_applies_to_next_build() {
        let resolved = ResolvedIntent {
            invocations: vec![Invocation::new("s1", "create_event", json!({"title": "sync"}))],
            confidence: 1.0,
            ..ResolvedIntent::default()
        };
        let builder = builder();
        assert!(matches!(
            builder.build(&resolved, None).unwrap(),
            PlanOutcome::NeedsConfirmation { .. }
        ));

        let mut config = builder.gate_config();
        config.auto_approve.insert("create_event".to_string());
        builder.update_gate_config(config);
        assert!(matches!(
            builder.build(&resolved, None).unwrap(),
            PlanOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_auto_step_downstream_of_gated_step_is_blocked() {
        let resolved = ResolvedIntent {
            invocations: vec![
                Invocation::new("s1", "send_email", json!({"to": "a@b.io", "subject": "x"})),
                Invocation::new("s2", "web_search", json!({"query": "follow up"})),
            ],
            edges: vec![DependencyEdge::new("s1", "s2")],
            confidence: 1.0,
            ..ResolvedIntent::default()
        };
        let (plan, proposal) = builder().build(&resolved, None).unwrap().into_parts();
        assert_eq!(plan.status_of("s2"), Some(StepStatus::Blocked));
        assert_eq!(proposal.unwrap().items.len(), 1);
    }

    #[test]
    fn test_construction_errors_are_fatal() {
        let unknown = ResolvedIntent {
            invocations: vec![Invocation::new("s1", "teleport", json!({}))],
            ..ResolvedIntent::default()
        };
        assert_eq!(
            builder().build(&unknown, None).unwrap_err(),
            PlanError::UnknownCapability("teleport".into())
        );

        let bad_params = ResolvedIntent {
            invocations: vec![Invocation::new(
                "s1",
                "send_email",
                json!({"to": "John", "subject": "x"}),
            )],
            ..ResolvedIntent::default()
        };
        assert!(matches!(
            builder().build(&bad_params, None),
            Err(PlanError::InvalidParameters { .. })
        ));

        let cyclic = ResolvedIntent {
            invocations: vec![
                Invocation::new("s1", "web_search", json!({"query": "a"})),
                Invocation::new("s2", "web_search", json!({"query": "b"})),
            ],
            edges: vec![DependencyEdge::new("s1", "s2"), DependencyEdge::new("s2", "s1")],
            ..ResolvedIntent::default()
        };
        assert!(matches!(
            builder().build(&cyclic, None),
            Err(PlanError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_cancel_skips_gated_and_downstream_steps() {
        let (mut plan, _) = builder().build(&email_john(), None).unwrap().into_parts();
        plan.transition(PlanState::AutoStepsRunning).unwrap();
        plan.set_status("s1", StepStatus::Succeeded);
        plan.transition(PlanState::AwaitingConfirmation).unwrap();

        let skipped = terminate_plan(&mut plan, PlanState::Cancelled, SkipReason::Cancelled).unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(
            skipped.get(&"s2".into()).unwrap().skip_reason(),
            Some(&SkipReason::Cancelled)
        );
        assert_eq!(plan.status_of("s1"), Some(StepStatus::Succeeded));
        assert_eq!(plan.status_of("s2"), Some(StepStatus::Skipped));
        assert_eq!(plan.state, PlanState::Completed);
    }

    #[test]
    fn test_confirm_releases_blocked_steps_once() {
        let (mut plan, _) = builder().build(&email_john(), None).unwrap().into_parts();
        plan.transition(PlanState::AutoStepsRunning).unwrap();
        plan.transition(PlanState::AwaitingConfirmation).unwrap();
        confirm_plan(&mut plan).unwrap();
        assert_eq!(plan.status_of("s2"), Some(StepStatus::Pending));
        assert!(matches!(
            confirm_plan(&mut plan),
            Err(PlanError::InvalidTransition { .. })
        ));
    }
}
