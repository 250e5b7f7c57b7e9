//! Step and plan result definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::StepId;
use crate::capability::CapabilityError;

/// Why a step never ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// An upstream step failed or was skipped
    DependencyFailed { dependency: StepId },
    /// The caller cancelled the plan
    Cancelled,
    /// The proposal expired without a decision
    Expired,
    /// A newer request in the same session replaced this plan
    Superseded,
    /// The plan-level deadline elapsed before dispatch
    PlanTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { data: Value },
    Failed { error: CapabilityError },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub capability: String,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
    /// Handler calls made (0 when the call was short-circuited)
    pub attempts: u32,
}

impl StepResult {
    pub fn succeeded(
        step_id: StepId,
        capability: impl Into<String>,
        data: Value,
        duration_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            step_id,
            capability: capability.into(),
            outcome: StepOutcome::Succeeded { data },
            duration_ms,
            attempts,
        }
    }

    pub fn failed(
        step_id: StepId,
        capability: impl Into<String>,
        error: CapabilityError,
        duration_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            step_id,
            capability: capability.into(),
            outcome: StepOutcome::Failed { error },
            duration_ms,
            attempts,
        }
    }

    pub fn skipped(step_id: StepId, capability: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            step_id,
            capability: capability.into(),
            outcome: StepOutcome::Skipped { reason },
            duration_ms: 0,
            attempts: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Succeeded { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, StepOutcome::Skipped { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match &self.outcome {
            StepOutcome::Succeeded { data } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CapabilityError> {
        match &self.outcome {
            StepOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match &self.outcome {
            StepOutcome::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Results of one plan keyed by step id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanResult {
    pub steps: BTreeMap<StepId, StepResult>,
}

impl PlanResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: StepResult) {
        self.steps.insert(result.step_id.clone(), result);
    }

    /// Fold another phase's results in; later results win
    pub fn merge(&mut self, other: PlanResult) {
        self.steps.extend(other.steps);
    }

    pub fn get(&self, step_id: &StepId) -> Option<&StepResult> {
        self.steps.get(step_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &StepResult> {
        self.iter().filter(|r| r.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepResult> {
        self.iter().filter(|r| r.is_failure())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &StepResult> {
        self.iter().filter(|r| r.is_skipped())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_result_is_keyed_by_step_id() {
        let mut result = PlanResult::new();
        result.insert(StepResult::succeeded("s10".into(), "b", json!({}), 3, 1));
        result.insert(StepResult::succeeded("s2".into(), "a", json!({}), 5, 1));
        result.insert(StepResult::skipped("s3".into(), "c", SkipReason::Cancelled));

        let order: Vec<&str> = result.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(order, vec!["s2", "s3", "s10"]);
        assert_eq!(result.succeeded().count(), 2);
        assert!(!result.has_failures());
    }

    #[test]
    fn test_merge_overwrites_earlier_phase() {
        let mut first = PlanResult::new();
        first.insert(StepResult::skipped("s1".into(), "a", SkipReason::Cancelled));
        let mut second = PlanResult::new();
        second.insert(StepResult::failed(
            "s1".into(),
            "a",
            CapabilityError::validation("bad"),
            1,
            1,
        ));
        first.merge(second);
        assert!(first.get(&"s1".into()).unwrap().is_failure());
    }
}
