//! Step type definitions
//!
//! ExecutionStep represents one planned capability invocation inside an
//! ExecutionPlan.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Strongly-typed Step ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Sequential id used by the resolver: `s1`, `s2`, ...
    pub fn ordinal(index: usize) -> Self {
        Self(format!("s{}", index + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn sort_key(&self) -> (&str, Option<u64>) {
        let prefix = self.0.trim_end_matches(|c: char| c.is_ascii_digit());
        let number = self.0[prefix.len()..].parse().ok();
        (prefix, number)
    }
}

// Numeric suffixes compare numerically so `s2` sorts before `s10`.
impl Ord for StepId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for StepId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&StepId> for StepId {
    fn from(value: &StepId) -> Self {
        value.clone()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Held back until the plan's proposal is confirmed
    Blocked,
    /// All dependencies succeeded, eligible for dispatch
    Ready,
    /// Handler invocation in flight
    Running,
    Succeeded,
    Failed,
    /// Never ran (upstream failure, cancellation, expiry)
    Skipped,
}

impl StepStatus {
    /// Check if the step reached a final status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Failed or skipped: dependents must not run
    pub fn poisons_dependents(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Whether a step may run without asking the user first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    #[default]
    Auto,
    NeedsConfirmation,
}

/// Binds a parameter of this step to an output key of an upstream step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamBinding {
    /// Parameter filled on this step
    pub param: String,
    /// Upstream step producing the value
    pub from_step: StepId,
    /// Key read from the upstream step's result data
    pub output_key: String,
}

impl ParamBinding {
    pub fn new(
        param: impl Into<String>,
        from_step: impl Into<StepId>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            param: param.into(),
            from_step: from_step.into(),
            output_key: output_key.into(),
        }
    }
}

/// A single step in the execution plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: StepId,
    /// Name of the capability descriptor this step invokes
    pub capability: String,
    /// Validated parameters (bound parameters are filled at dispatch time)
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub bindings: Vec<ParamBinding>,
    #[serde(default)]
    pub confirmation: ConfirmationMode,
    #[serde(default)]
    pub status: StepStatus,
}

impl ExecutionStep {
    /// Create a new auto step
    pub fn new(id: impl Into<StepId>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            parameters: Value::Object(serde_json::Map::new()),
            depends_on: Vec::new(),
            bindings: Vec::new(),
            confirmation: ConfirmationMode::Auto,
            status: StepStatus::Pending,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<StepId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_bindings(mut self, bindings: Vec<ParamBinding>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationMode) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn needs_confirmation(&self) -> bool {
        self.confirmation == ConfirmationMode::NeedsConfirmation
    }

    /// Look up a parameter by name
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Binding for a given parameter, if any
    pub fn binding_for(&self, param: &str) -> Option<&ParamBinding> {
        self.bindings.iter().find(|b| b.param == param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_terminal_flags() {
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Blocked.is_terminal());
        assert!(!StepStatus::Running.is_terminal());

        assert!(StepStatus::Failed.poisons_dependents());
        assert!(StepStatus::Skipped.poisons_dependents());
        assert!(!StepStatus::Succeeded.poisons_dependents());
    }

    #[test]
    fn test_step_ids_order_lexically_and_by_ordinal() {
        assert_eq!(StepId::ordinal(0), "s1");
        assert_eq!(StepId::ordinal(4).as_str(), "s5");
        assert!(StepId::from("s1") < StepId::from("s2"));
        assert!(StepId::from("s2") < StepId::from("s10"));
    }
}
