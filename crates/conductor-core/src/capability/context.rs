//! ExecutionContext type definition

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::types::{PlanId, SessionId, StepId};

/// Opaque credential material keyed by provider (`google`, `slack`, ...).
///
/// The orchestrator only checks presence and forwards the set; contents are
/// never inspected or logged.
#[derive(Clone, Default)]
pub struct CredentialSet {
    secrets: Arc<HashMap<String, String>>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.secrets).insert(provider.into(), secret.into());
        self
    }

    pub fn has(&self, provider: &str) -> bool {
        self.secrets.contains_key(provider)
    }

    /// Secret for a provider, for the handler's own use
    pub fn get(&self, provider: &str) -> Option<&str> {
        self.secrets.get(provider).map(String::as_str)
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut providers: Vec<&str> = self.secrets.keys().map(String::as_str).collect();
        providers.sort_unstable();
        providers
    }
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("providers", &self.providers())
            .finish_non_exhaustive()
    }
}

/// Context handed to every capability invocation
#[derive(Clone)]
pub struct ExecutionContext {
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub credentials: CredentialSet,
    /// Cancelled when the plan is cancelled or superseded; handlers may
    /// observe it but the engine never aborts an in-flight call
    pub cancellation_token: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        session_id: impl Into<SessionId>,
        plan_id: impl Into<PlanId>,
        step_id: impl Into<StepId>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            plan_id: plan_id.into(),
            step_id: step_id.into(),
            credentials: CredentialSet::default(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("plan_id", &self.plan_id)
            .field("step_id", &self.step_id)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_prints_secrets() {
        let creds = CredentialSet::new()
            .with("google", "ya29.secret-token")
            .with("slack", "xoxb-secret");
        let mut ctx = ExecutionContext::new("sess", "plan", "s1");
        ctx.credentials = creds;

        let rendered = format!("{:?}", ctx);
        assert!(rendered.contains("google"));
        assert!(!rendered.contains("ya29"));
        assert!(!rendered.contains("xoxb"));
        assert!(ctx.credentials.has("slack"));
        assert!(!ctx.credentials.has("github"));
    }
}
