//! Capability abstraction module
//!
//! This module defines the capability seam:
//! - Capability: async handler trait invoked by the execution engine
//! - CapabilityDescriptor: immutable catalog entry with gating properties
//! - CapabilityRegistry: declaration-ordered catalog with bound handlers
//! - ParameterSchema: typed parameter declarations
//! - CapabilityError: step-level error taxonomy

mod context;
mod error;
mod registry;
mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub use context::{CredentialSet, ExecutionContext};
pub use error::CapabilityError;
pub use registry::{CapabilityRegistry, RegistryError};
pub use schema::{IdentityKind, ParamKind, ParamSpec, ParameterSchema, SchemaError};

pub use tokio_util::sync::CancellationToken;

/// Capability trait - uniform interface to one external operation
///
/// Handlers are opaque to the orchestrator. They receive validated
/// parameters (bindings already filled) and classify their own failures.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, params: Value, ctx: ExecutionContext) -> Result<Value, CapabilityError>;
}

/// Declares that a capability turns a bare name into a canonical identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProvider {
    pub kind: IdentityKind,
    /// Parameter receiving the bare name
    pub input_param: String,
    /// Result data key holding the canonical identifier
    pub output_key: String,
}

/// Static catalog entry, created once at startup and never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    /// Human phrase used in replies ("send an email")
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameter_schema: ParameterSchema,
    #[serde(default)]
    pub mutates_external_state: bool,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub requires_auth: bool,
    /// Credential key checked when `requires_auth` is set
    #[serde(default)]
    pub auth_provider: Option<String>,
    /// Classification hints (single words or phrases)
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Per-capability timeout override
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub identity_provider: Option<IdentityProvider>,
}

impl CapabilityDescriptor {
    /// Read-only, non-confirming, no auth
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.replace('_', " "),
            name,
            description: String::new(),
            parameter_schema: ParameterSchema::default(),
            mutates_external_state: false,
            requires_confirmation: false,
            requires_auth: false,
            auth_provider: None,
            keywords: Vec::new(),
            timeout_ms: None,
            identity_provider: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.parameter_schema = ParameterSchema::new(params);
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutates_external_state = true;
        self
    }

    pub fn confirming(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_auth(mut self, provider: impl Into<String>) -> Self {
        self.requires_auth = true;
        self.auth_provider = Some(provider.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_identity_provider(
        mut self,
        kind: IdentityKind,
        input_param: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        self.identity_provider = Some(IdentityProvider {
            kind,
            input_param: input_param.into(),
            output_key: output_key.into(),
        });
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Credential key for auth checks; falls back to the capability name
    pub fn credential_key(&self) -> &str {
        self.auth_provider.as_deref().unwrap_or(&self.name)
    }

    pub fn is_read_only(&self) -> bool {
        !self.mutates_external_state
    }
}
