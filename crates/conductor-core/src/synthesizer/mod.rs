//! Reply synthesis
//!
//! Turns a plan and its collected results into one user-facing message.
//! Failures are phrased by error kind; cancellation and expiry are reported
//! as such rather than as failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::capability::{CapabilityError, CapabilityRegistry};
use crate::planner::{describe_step, PlanError};
use crate::types::{
    ExecutionPlan, PlanResult, PlanState, Proposal, SkipReason, StepOutcome, StepStatus,
};

/// Overall status carried in reply metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Completed,
    PartiallyCompleted,
    Failed,
    AwaitingConfirmation,
    Cancelled,
    Expired,
    NeedsClarification,
    PlanRejected,
}

/// Input payload for synthesis.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    /// Original user utterance.
    pub utterance: String,
    pub plan: ExecutionPlan,
    /// Every step result collected so far, across phases.
    pub result: PlanResult,
    /// Present while the plan awaits a decision.
    pub proposal: Option<Proposal>,
}

impl SynthesisRequest {
    pub fn new(utterance: impl Into<String>, plan: ExecutionPlan, result: PlanResult) -> Self {
        Self {
            utterance: utterance.into(),
            plan,
            result,
            proposal: None,
        }
    }

    pub fn with_proposal(mut self, proposal: Proposal) -> Self {
        self.proposal = Some(proposal);
        self
    }
}

/// Output payload from the synthesizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    /// User-facing message.
    pub message: String,
    pub status: ReplyStatus,
    /// Capabilities that were attempted
    #[serde(default)]
    pub ran: Vec<String>,
    /// Capabilities still waiting on a decision
    #[serde(default)]
    pub still_pending: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("failed to synthesize reply: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<Synthesis, SynthesisError>;
}

/// Deterministic template synthesizer.
pub struct TemplateSynthesizer {
    registry: Arc<CapabilityRegistry>,
}

impl TemplateSynthesizer {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    fn label(&self, capability: &str) -> String {
        self.registry
            .get(capability)
            .map(|d| d.label.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| capability.replace('_', " "))
    }

    /// Reply used when the resolver could not map the utterance
    pub fn clarification(&self, utterance: &str) -> Synthesis {
        let labels: Vec<String> = self
            .registry
            .descriptors()
            .iter()
            .map(|d| d.label.clone())
            .collect();
        let message = if utterance.trim().is_empty() {
            format!(
                "I didn't catch a request. I can {}.",
                join_choices(&labels)
            )
        } else {
            format!(
                "I'm not sure what you'd like me to do with \"{}\". Could you rephrase? I can {}.",
                utterance.trim(),
                join_choices(&labels)
            )
        };
        Synthesis {
            message,
            status: ReplyStatus::NeedsClarification,
            ran: Vec::new(),
            still_pending: Vec::new(),
            metadata: json!({ "status": ReplyStatus::NeedsClarification }),
        }
    }

    /// Reply used when a plan could not be constructed
    pub fn rejected(&self, utterance: &str, error: &PlanError) -> Synthesis {
        Synthesis {
            message: format!(
                "I couldn't put together a plan for \"{}\": {}.",
                utterance.trim(),
                error
            ),
            status: ReplyStatus::PlanRejected,
            ran: Vec::new(),
            still_pending: Vec::new(),
            metadata: json!({
                "status": ReplyStatus::PlanRejected,
                "error": error.to_string(),
            }),
        }
    }

    pub fn compose(&self, request: &SynthesisRequest) -> Synthesis {
        let plan = &request.plan;
        let result = &request.result;
        let awaiting = plan.state == PlanState::AwaitingConfirmation && request.proposal.is_some();

        let mut sentences: Vec<String> = Vec::new();
        let mut step_summaries: Vec<Value> = Vec::new();
        for step in &plan.steps {
            let Some(step_result) = result.get(&step.id) else {
                continue;
            };
            let label = self.label(&step.capability);
            let sentence = match &step_result.outcome {
                StepOutcome::Succeeded { data } => {
                    let description = describe_step(&self.registry, plan, step, Some(result));
                    match data.get("summary").and_then(Value::as_str) {
                        Some(summary) => format!("Done: {}. {}", description, summary),
                        None => format!("Done: {}.", description),
                    }
                }
                StepOutcome::Failed { error } => describe_failure(&label, error),
                StepOutcome::Skipped { reason } => self.describe_skip(&label, reason, plan),
            };
            sentences.push(sentence);
            step_summaries.push(json!({
                "step_id": step.id,
                "capability": step.capability,
                "outcome": outcome_kind(&step_result.outcome),
            }));
        }

        let still_pending: Vec<String> = if awaiting {
            plan.steps
                .iter()
                .filter(|s| s.status == StepStatus::Blocked)
                .map(|s| s.capability.clone())
                .collect()
        } else {
            Vec::new()
        };

        if let (true, Some(proposal)) = (awaiting, request.proposal.as_ref()) {
            let items = proposal.descriptions();
            let ask = match items.as_slice() {
                [single] => format!("Before I go ahead, please confirm: {}.", single),
                many => {
                    let numbered: Vec<String> = many
                        .iter()
                        .enumerate()
                        .map(|(i, d)| format!("{}) {}", i + 1, d))
                        .collect();
                    format!(
                        "Before I go ahead, please confirm the following: {}.",
                        numbered.join("; ")
                    )
                }
            };
            sentences.push(ask);
            sentences.push("Reply confirm or cancel.".to_string());
        }

        let status = if awaiting {
            ReplyStatus::AwaitingConfirmation
        } else {
            overall_status(result)
        };
        let ran: Vec<String> = result
            .iter()
            .filter(|r| !r.is_skipped())
            .map(|r| r.capability.clone())
            .collect();

        let message = if sentences.is_empty() {
            "There was nothing to do.".to_string()
        } else {
            sentences.join(" ")
        };

        Synthesis {
            message,
            status,
            metadata: json!({
                "status": status,
                "plan_id": plan.id,
                "ran": ran,
                "still_pending": still_pending,
                "steps": step_summaries,
            }),
            ran,
            still_pending,
        }
    }

    fn describe_skip(&self, label: &str, reason: &SkipReason, plan: &ExecutionPlan) -> String {
        match reason {
            SkipReason::DependencyFailed { dependency } => {
                let upstream = plan
                    .get_step(dependency.as_str())
                    .map(|s| self.label(&s.capability))
                    .unwrap_or_else(|| dependency.to_string());
                format!(
                    "I didn't {} because the earlier step to {} didn't succeed.",
                    label, upstream
                )
            }
            SkipReason::Cancelled => format!("Cancelled as requested: I did not {}.", label),
            SkipReason::Superseded => {
                format!("I did not {} because a newer request replaced this one.", label)
            }
            SkipReason::Expired => format!(
                "The confirmation window closed, so I did not {}.",
                label
            ),
            SkipReason::PlanTimeout => format!("I ran out of time before I could {}.", label),
        }
    }
}

#[async_trait]
impl Synthesizer for TemplateSynthesizer {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<Synthesis, SynthesisError> {
        Ok(self.compose(&request))
    }
}

fn describe_failure(label: &str, error: &CapabilityError) -> String {
    match error {
        CapabilityError::Validation { message } => {
            format!("I couldn't {}: {}.", label, message.trim_end_matches('.'))
        }
        CapabilityError::Auth { provider, .. } => format!(
            "I couldn't {} because your {} access has lapsed; please reconnect {}.",
            label, provider, provider
        ),
        CapabilityError::Transient { .. } => format!(
            "I couldn't {} because the service didn't respond in time. You can try again shortly.",
            label
        ),
        CapabilityError::Unavailable { .. } => format!(
            "I couldn't {} because that service is temporarily unavailable.",
            label
        ),
    }
}

fn outcome_kind(outcome: &StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Succeeded { .. } => "succeeded",
        StepOutcome::Failed { .. } => "failed",
        StepOutcome::Skipped { .. } => "skipped",
    }
}

fn overall_status(result: &PlanResult) -> ReplyStatus {
    let succeeded = result.succeeded().count();
    if result.has_failures() {
        return if succeeded > 0 {
            ReplyStatus::PartiallyCompleted
        } else {
            ReplyStatus::Failed
        };
    }
    let reasons: Vec<&SkipReason> = result.skipped().filter_map(|r| r.skip_reason()).collect();
    if reasons.iter().any(|r| **r == SkipReason::Expired) {
        ReplyStatus::Expired
    } else if reasons
        .iter()
        .any(|r| matches!(r, SkipReason::Cancelled | SkipReason::Superseded))
    {
        ReplyStatus::Cancelled
    } else if reasons.is_empty() {
        ReplyStatus::Completed
    } else {
        ReplyStatus::PartiallyCompleted
    }
}

fn join_choices(labels: &[String]) -> String {
    match labels {
        [] => "help once capabilities are configured".to_string(),
        [only] => only.clone(),
        [init @ .., last] => format!("{}, or {}", init.join(", "), last),
    }
}
