//! Capability catalog configuration types.
//!
//! These types define how capability descriptors are declared in YAML.

use serde::Deserialize;

/// Parameter kinds accepted in `parameters[].kind`.
pub const PARAM_KINDS: &[&str] = &[
    "string",
    "text",
    "integer",
    "boolean",
    "array",
    "object",
    "identity:email",
    "identity:phone",
];

/// Identity kinds accepted in `identity_provider.kind`.
pub const IDENTITY_KINDS: &[&str] = &["email", "phone"];

/// Root configuration for the capability catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilitiesConfig {
    /// Capability declarations, in registry order.
    #[serde(default)]
    pub catalog: Vec<CapabilitySpec>,
}

impl CapabilitiesConfig {
    /// Get capability spec by name.
    pub fn get(&self, name: &str) -> Option<&CapabilitySpec> {
        self.catalog.iter().find(|c| c.name == name)
    }

    /// List all capability names.
    pub fn names(&self) -> Vec<&str> {
        self.catalog.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Single capability declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    /// Human phrase, e.g. "send an email".
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub mutates_external_state: bool,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Credential provider key; presence implies `requires_auth`.
    #[serde(default)]
    pub auth_provider: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub identity_provider: Option<IdentityProviderSpec>,
}

impl CapabilitySpec {
    /// Get label or fallback derived from the name.
    pub fn label_or_default(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.name.replace('_', " "))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default = "default_param_kind")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    /// Words that introduce this parameter's value in an utterance.
    #[serde(default)]
    pub cues: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_param_kind() -> String {
    "string".to_string()
}

/// Declares that a capability turns a bare name into a canonical identity.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProviderSpec {
    pub kind: String,
    pub input_param: String,
    pub output_key: String,
}
