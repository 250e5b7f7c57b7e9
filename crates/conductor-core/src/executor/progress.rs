//! Execution progress events

use async_trait::async_trait;

use crate::types::{PlanId, StepId};

/// Realtime execution progress event.
#[derive(Debug, Clone)]
pub struct ExecutionProgressEvent {
    pub plan_id: PlanId,
    pub step_id: Option<StepId>,
    pub capability: Option<String>,
    /// Phase label: step_started, step_retrying, step_succeeded, step_failed,
    /// step_skipped, plan_finished.
    pub phase: String,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
}

impl ExecutionProgressEvent {
    pub fn new(
        plan_id: impl Into<PlanId>,
        step_id: Option<StepId>,
        capability: Option<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            step_id,
            capability,
            phase: phase.into(),
            message: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sink interface for execution progress reporting.
#[async_trait]
pub trait ExecutionProgressReporter: Send + Sync {
    async fn report(&self, event: ExecutionProgressEvent) -> Result<(), String>;
}
