//! ExecutionPlan type definitions
//!
//! An ExecutionPlan is the DAG of steps derived from one resolved request,
//! together with the plan-level state machine driven by the confirmation gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{ExecutionStep, StepId, StepStatus};

/// Type alias for Plan ID
pub type PlanId = String;

/// Type alias for Session ID
pub type SessionId = String;

/// Plan state machine
///
/// `Draft → AutoStepsRunning → AwaitingConfirmation → {Confirmed | Cancelled | Expired} → Completed`.
/// Plans without gated steps go straight from `AutoStepsRunning` to `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Draft,
    AutoStepsRunning,
    AwaitingConfirmation,
    Confirmed,
    Cancelled,
    Expired,
    Completed,
}

impl PlanState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: PlanState) -> bool {
        use PlanState::*;
        matches!(
            (self, next),
            (Draft, AutoStepsRunning)
                | (AutoStepsRunning, AwaitingConfirmation)
                | (AutoStepsRunning, Completed)
                | (AwaitingConfirmation, Confirmed)
                | (AwaitingConfirmation, Cancelled)
                | (AwaitingConfirmation, Expired)
                | (Confirmed, Completed)
                | (Cancelled, Completed)
                | (Expired, Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanState::Completed)
    }
}

/// Execution plan for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: PlanId,
    /// Session owning this plan
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Steps in declaration order
    pub steps: Vec<ExecutionStep>,
    pub state: PlanState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Create a new draft plan
    pub fn new(steps: Vec<ExecutionStep>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            steps,
            state: PlanState::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Move the plan to `next`, returning the rejected pair on an illegal move
    pub fn transition(&mut self, next: PlanState) -> Result<(), (PlanState, PlanState)> {
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn get_step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id.as_str() == id)
    }

    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut ExecutionStep> {
        self.steps.iter_mut().find(|s| s.id.as_str() == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.get_step(id).map(|s| s.status)
    }

    pub fn set_status(&mut self, id: &str, status: StepStatus) {
        if let Some(step) = self.get_step_mut(id) {
            step.status = status;
        }
        self.updated_at = Utc::now();
    }

    /// Steps that directly depend on `id`
    pub fn dependents_of(&self, id: &str) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d.as_str() == id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// All steps transitively downstream of `id` (excluding `id`)
    pub fn descendants_of(&self, id: &str) -> Vec<StepId> {
        let mut seen: HashSet<StepId> = HashSet::new();
        let mut stack = self.dependents_of(id);
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            stack.extend(self.dependents_of(next.as_str()));
            out.push(next);
        }
        out.sort();
        out
    }

    /// Steps currently held back by the confirmation gate
    pub fn blocked_steps(&self) -> Vec<&ExecutionStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Blocked)
            .collect()
    }

    /// Steps gated for confirmation that have not yet reached a final status
    pub fn open_gated_steps(&self) -> Vec<&ExecutionStep> {
        self.steps
            .iter()
            .filter(|s| s.needs_confirmation() && !s.status.is_terminal())
            .collect()
    }

    pub fn has_gated_steps(&self) -> bool {
        self.steps.iter().any(|s| s.needs_confirmation())
    }

    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> ExecutionPlan {
        ExecutionPlan::new(vec![
            ExecutionStep::new("s1", "a"),
            ExecutionStep::new("s2", "b").with_depends_on(vec!["s1".into()]),
            ExecutionStep::new("s3", "c").with_depends_on(vec!["s1".into()]),
            ExecutionStep::new("s4", "d").with_depends_on(vec!["s2".into(), "s3".into()]),
        ])
    }

    #[test]
    fn test_plan_state_transitions() {
        let mut plan = diamond();
        assert_eq!(plan.state, PlanState::Draft);
        assert!(plan.transition(PlanState::Completed).is_err());
        plan.transition(PlanState::AutoStepsRunning).unwrap();
        plan.transition(PlanState::AwaitingConfirmation).unwrap();
        assert!(plan.transition(PlanState::AutoStepsRunning).is_err());
        plan.transition(PlanState::Expired).unwrap();
        plan.transition(PlanState::Completed).unwrap();
        assert!(plan.state.is_terminal());
        assert_eq!(
            plan.transition(PlanState::Confirmed),
            Err((PlanState::Completed, PlanState::Confirmed))
        );
    }

    #[test]
    fn test_descendants_are_transitive_and_deduplicated() {
        let plan = diamond();
        assert_eq!(
            plan.descendants_of("s1"),
            vec![StepId::from("s2"), StepId::from("s3"), StepId::from("s4")]
        );
        assert_eq!(plan.descendants_of("s3"), vec![StepId::from("s4")]);
        assert!(plan.descendants_of("s4").is_empty());
    }
}
