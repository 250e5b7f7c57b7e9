//! Resolved intent definitions
//!
//! Output of the intent & dependency resolver, input of the plan builder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ParamBinding, StepId};

/// One planned capability call before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub id: StepId,
    pub capability: String,
    #[serde(default)]
    pub raw_parameters: Value,
    /// Parameters filled from upstream outputs at dispatch time
    #[serde(default)]
    pub bindings: Vec<ParamBinding>,
}

impl Invocation {
    pub fn new(id: impl Into<StepId>, capability: impl Into<String>, raw_parameters: Value) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            raw_parameters,
            bindings: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: ParamBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

/// `from` must complete before `to` may start
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: StepId,
    pub to: StepId,
}

impl DependencyEdge {
    pub fn new(from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Which classifier produced the intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    #[default]
    Keyword,
    Classifier,
    /// Classifier failed; keyword matching was used instead
    KeywordFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResolvedIntent {
    pub invocations: Vec<Invocation>,
    pub edges: Vec<DependencyEdge>,
    #[serde(default)]
    pub clarification_needed: bool,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub source: ResolutionSource,
}

impl ResolvedIntent {
    /// Empty result asking the caller to rephrase
    pub fn clarification(confidence: f32, source: ResolutionSource) -> Self {
        Self {
            invocations: Vec::new(),
            edges: Vec::new(),
            clarification_needed: true,
            confidence,
            source,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }

    /// Dependencies of one invocation, in edge order
    pub fn dependencies_of(&self, id: &StepId) -> Vec<StepId> {
        let mut deps: Vec<StepId> = Vec::new();
        for edge in self.edges.iter().filter(|e| &e.to == id) {
            if !deps.contains(&edge.from) {
                deps.push(edge.from.clone());
            }
        }
        deps
    }

    pub fn capabilities(&self) -> Vec<&str> {
        self.invocations
            .iter()
            .map(|i| i.capability.as_str())
            .collect()
    }
}
