//! # Conductor Config
//!
//! Unified single-file configuration management for Conductor.
//! A single `conductor.yaml` configures the runtime, resolver, execution
//! limits, confirmation gate, sessions, observability and the capability
//! catalog.

mod capabilities;
mod loader;

pub use capabilities::{
    CapabilitiesConfig, CapabilitySpec, IdentityProviderSpec, ParameterSpec, IDENTITY_KINDS,
    PARAM_KINDS,
};
pub use loader::{load_config, validate_config, ConfigError, ConfigManager, ConfigWatcher};

use serde::Deserialize;

/// Top-level configuration schema for Conductor.
#[derive(Debug, Clone, Deserialize)]
pub struct ConductorConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            runtime: RuntimeConfig::default(),
            resolver: ResolverConfig::default(),
            execution: ExecutionConfig::default(),
            confirmation: ConfirmationConfig::default(),
            session: SessionConfig::default(),
            observability: ObservabilityConfig::default(),
            capabilities: CapabilitiesConfig::default(),
        }
    }
}

impl ConductorConfig {
    pub fn capabilities(&self) -> &CapabilitiesConfig {
        &self.capabilities
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "conductor".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// What a new submit does to the session's current plan:
    /// `supersede` or `queue`.
    #[serde(default = "default_session_policy")]
    pub session_policy: String,
    /// Deadline for one execution phase of a plan.
    #[serde(default = "default_plan_timeout_ms")]
    pub plan_timeout_ms: u64,
    /// How often pending proposals are checked for expiry
    #[serde(default = "default_expiry_sweep_ms")]
    pub expiry_sweep_ms: u64,
    /// Re-read this file on change and apply gate and resolver settings
    #[serde(default)]
    pub hot_reload: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_policy: default_session_policy(),
            plan_timeout_ms: default_plan_timeout_ms(),
            expiry_sweep_ms: default_expiry_sweep_ms(),
            hot_reload: false,
        }
    }
}

fn default_session_policy() -> String {
    "supersede".to_string()
}

fn default_plan_timeout_ms() -> u64 {
    120_000
}

fn default_expiry_sweep_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// `keyword` or `llm`.
    #[serde(default = "default_resolver_mode")]
    pub mode: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Snippets fetched when an utterance contains back references.
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: default_resolver_mode(),
            confidence_threshold: default_confidence_threshold(),
            context_limit: default_context_limit(),
            llm: None,
        }
    }
}

fn default_resolver_mode() -> String {
    "keyword".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_context_limit() -> usize {
    6
}

/// OpenAI-compatible chat completion endpoint used by the LLM classifier.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Global cap on simultaneously in-flight capability calls.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_read_only_timeout_ms")]
    pub read_only_timeout_ms: u64,
    #[serde(default = "default_mutating_timeout_ms")]
    pub mutating_timeout_ms: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            read_only_timeout_ms: default_read_only_timeout_ms(),
            mutating_timeout_ms: default_mutating_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

fn default_max_in_flight() -> usize {
    8
}

fn default_read_only_timeout_ms() -> u64 {
    10_000
}

fn default_mutating_timeout_ms() -> u64 {
    30_000
}

fn default_max_retry_attempts() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_breaker_failure_threshold() -> u32 {
    3
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    /// Mutating capabilities that run without confirmation.
    #[serde(default)]
    pub auto_approve: Vec<String>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            auto_approve: Vec::new(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_window_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_max_history() -> usize {
    50
}

fn default_max_sessions() -> usize {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
