//! Step-level error taxonomy

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classified error returned by a capability handler (or synthesized by the
/// engine). Captured in the step result, never propagated past the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    /// Bad parameters; never retried, surfaced verbatim
    #[error("{message}")]
    Validation { message: String },

    /// Network, timeout or upstream 5xx; retried with backoff
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    /// Missing or invalid credential; never retried
    #[error("authentication required for {provider}: {message}")]
    Auth { provider: String, message: String },

    /// Circuit open; the call was short-circuited
    #[error("capability '{capability}' is unavailable")]
    Unavailable { capability: String },
}

impl CapabilityError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn transient_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after_ms: Some(retry_after.as_millis() as u64),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::transient(format!("timed out after {}ms", after.as_millis()))
    }

    pub fn auth(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(capability: impl Into<String>) -> Self {
        Self::Unavailable {
            capability: capability.into(),
        }
    }

    /// Only transient failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Failures counted by the circuit breaker
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Short machine-readable class name, used in logs and metadata
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Transient { .. } => "transient",
            Self::Auth { .. } => "auth",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(CapabilityError::transient("reset").is_retryable());
        assert!(CapabilityError::timeout(Duration::from_millis(20)).is_retryable());
        assert!(!CapabilityError::validation("bad").is_retryable());
        assert!(!CapabilityError::auth("google", "expired").is_retryable());
        assert!(!CapabilityError::unavailable("send_email").is_retryable());
    }

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = CapabilityError::validation("subject must not be empty");
        assert_eq!(err.to_string(), "subject must not be empty");
    }

    #[test]
    fn test_retry_after_hint() {
        let err = CapabilityError::transient_after("429", Duration::from_millis(250));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(CapabilityError::transient("x").retry_after(), None);
    }
}
