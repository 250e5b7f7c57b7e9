//! Bootstrap helpers for starting Conductor from a single YAML config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_classifiers::{
    HttpLlmClient, HttpLlmClientConfig, LlmClassifier, LlmClassifierConfig, LlmError,
};
use conductor_config::{
    CapabilitiesConfig, CapabilitySpec, ConductorConfig, ConfigError, ConfigManager,
    ConfigWatcher, ObservabilityConfig,
};
use conductor_core::capability::{
    Capability, CapabilityDescriptor, CapabilityRegistry, IdentityKind, ParamKind, ParamSpec,
    RegistryError,
};
use conductor_core::executor::{BreakerConfig, ExecutionEngine};
use conductor_core::planner::{GateConfig, PlanBuilder};
use conductor_core::resolver::{IntentResolver, ResolverConfig};
use conductor_core::store::SessionStore;
use conductor_stores::{InMemorySessionStore, SessionContextSource};

use crate::concurrency::SessionPolicy;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("invalid capability '{name}': {reason}")]
    InvalidCapability { name: String, reason: String },
    #[error("unsupported session policy: {0}")]
    UnsupportedSessionPolicy(String),
    #[error("unsupported resolver mode: {0}")]
    UnsupportedResolverMode(String),
    #[error("missing llm config for resolver mode llm")]
    MissingLlmConfig,
    #[error("classifier client error: {0}")]
    Classifier(#[from] LlmError),
}

/// Running app bundle created from unified config.
pub struct RuntimeApp {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<CapabilityRegistry>,
    pub config_manager: Arc<ConfigManager>,
    background_stop: CancellationToken,
    background: Vec<JoinHandle<()>>,
    _config_watcher: Option<ConfigWatcher>,
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

impl RuntimeApp {
    /// Create a runnable app from a `conductor.yaml` and the handlers that
    /// back its catalog. Catalog entries without a handler report themselves
    /// unavailable when a plan reaches them.
    pub async fn from_config_path(
        path: impl Into<PathBuf>,
        handlers: HashMap<String, Arc<dyn Capability>>,
    ) -> Result<Self, BootstrapError> {
        let config_manager = Arc::new(ConfigManager::new(path));
        config_manager.load().await?;
        let config = config_manager.config().read().await.clone();
        init_tracing_if_needed(&config.observability);

        let mut registry = registry_from_config(&config.capabilities)?;
        bind_handlers(&mut registry, handlers)?;
        let registry = Arc::new(registry);
        let orchestrator = Arc::new(build_orchestrator(&config, registry.clone())?);

        let shutdown = CancellationToken::new();
        let background = vec![
            orchestrator.spawn_expiry_sweeper(
                Duration::from_millis(config.runtime.expiry_sweep_ms),
                shutdown.child_token(),
            ),
            spawn_config_applier(
                config_manager.clone(),
                orchestrator.clone(),
                shutdown.child_token(),
            ),
        ];
        let config_watcher = if config.runtime.hot_reload {
            Some(config_manager.start_watching()?)
        } else {
            None
        };
        info!(
            app = %config.app.name,
            capabilities = registry.len(),
            policy = %config.runtime.session_policy,
            resolver = %config.resolver.mode,
            hot_reload = config.runtime.hot_reload,
            "conductor runtime ready"
        );

        Ok(Self {
            orchestrator,
            registry,
            config_manager,
            background_stop: shutdown,
            background,
            _config_watcher: config_watcher,
        })
    }

    /// Stop background tasks and wait for them to finish
    pub async fn shutdown(mut self) {
        self.background_stop.cancel();
        for task in std::mem::take(&mut self.background) {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        info!("conductor runtime stopped");
    }
}

impl Drop for RuntimeApp {
    fn drop(&mut self) {
        self.background_stop.cancel();
    }
}

/// Push reloaded gate and resolver settings into the running orchestrator.
/// The catalog and the runtime section are read once at startup.
fn spawn_config_applier(
    manager: Arc<ConfigManager>,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut reloads = manager.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = reloads.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = manager.config().read().await.clone();
                    apply_reloaded(&orchestrator, &config);
                }
            }
        }
        debug!("config applier stopped");
    })
}

fn apply_reloaded(orchestrator: &Orchestrator, config: &ConductorConfig) {
    orchestrator.builder().update_gate_config(gate_config(config));
    orchestrator.resolver().update_config(resolver_config(config));

    let declared: Vec<&str> = config
        .capabilities
        .catalog
        .iter()
        .map(|spec| spec.name.as_str())
        .collect();
    if declared != orchestrator.registry().names() {
        warn!(
            declared = ?declared,
            "capability catalog changed on disk; restart to apply it"
        );
    }
    info!(version = config.version, "reloaded settings applied");
}

pub fn gate_config(config: &ConductorConfig) -> GateConfig {
    GateConfig {
        auto_approve: config.confirmation.auto_approve.iter().cloned().collect(),
        confirmation_window: Duration::from_secs(config.confirmation.window_secs),
    }
}

pub fn resolver_config(config: &ConductorConfig) -> ResolverConfig {
    ResolverConfig {
        confidence_threshold: config.resolver.confidence_threshold,
        context_limit: config.resolver.context_limit,
    }
}

/// Declare every catalog entry, in file order
pub fn registry_from_config(
    config: &CapabilitiesConfig,
) -> Result<CapabilityRegistry, BootstrapError> {
    let mut registry = CapabilityRegistry::new();
    for spec in &config.catalog {
        registry.declare(descriptor_from_spec(spec)?)?;
    }
    Ok(registry)
}

pub fn bind_handlers(
    registry: &mut CapabilityRegistry,
    handlers: HashMap<String, Arc<dyn Capability>>,
) -> Result<(), BootstrapError> {
    for (name, handler) in handlers {
        if registry.get(&name).is_none() {
            warn!(capability = %name, "handler not declared in the catalog; ignored");
            continue;
        }
        registry.bind(&name, handler)?;
    }
    let unbound = registry.unbound();
    if !unbound.is_empty() {
        warn!(capabilities = ?unbound, "capabilities declared without a handler");
    }
    Ok(())
}

pub fn descriptor_from_spec(spec: &CapabilitySpec) -> Result<CapabilityDescriptor, BootstrapError> {
    let invalid = |reason: String| BootstrapError::InvalidCapability {
        name: spec.name.clone(),
        reason,
    };

    let mut params = Vec::with_capacity(spec.parameters.len());
    for param in &spec.parameters {
        let kind = ParamKind::try_from(param.kind.clone()).map_err(invalid)?;
        let mut declared = ParamSpec::new(&param.name, kind);
        declared.required = param.required;
        declared.cues = param.cues.clone();
        if let Some(description) = &param.description {
            declared.description = description.clone();
        }
        params.push(declared);
    }

    let mut descriptor = CapabilityDescriptor::new(&spec.name)
        .with_label(spec.label_or_default())
        .with_params(params);
    descriptor.keywords = spec.keywords.clone();
    descriptor.timeout_ms = spec.timeout_ms;
    if let Some(description) = &spec.description {
        descriptor = descriptor.with_description(description);
    }
    if spec.mutates_external_state {
        descriptor = descriptor.mutating();
    }
    if spec.requires_confirmation {
        descriptor = descriptor.confirming();
    }
    if let Some(provider) = &spec.auth_provider {
        descriptor = descriptor.with_auth(provider);
    }
    if let Some(provider) = &spec.identity_provider {
        let kind: IdentityKind = provider.kind.parse().map_err(invalid)?;
        descriptor =
            descriptor.with_identity_provider(kind, &provider.input_param, &provider.output_key);
    }
    Ok(descriptor)
}

/// Wire resolver, gate, engine and in-memory stores from config
pub fn build_orchestrator(
    config: &ConductorConfig,
    registry: Arc<CapabilityRegistry>,
) -> Result<Orchestrator, BootstrapError> {
    let session_policy: SessionPolicy = config
        .runtime
        .session_policy
        .parse()
        .map_err(|_| BootstrapError::UnsupportedSessionPolicy(config.runtime.session_policy.clone()))?;
    let resolver = build_resolver(config, registry.clone())?;

    let gate = gate_config(config);

    let execution = &config.execution;
    let engine = ExecutionEngine::new(registry.clone())
        .with_max_in_flight(execution.max_in_flight)
        .with_timeouts(
            Duration::from_millis(execution.read_only_timeout_ms),
            Duration::from_millis(execution.mutating_timeout_ms),
        )
        .with_retry_policy(
            execution.max_retry_attempts,
            Duration::from_millis(execution.retry_base_delay_ms),
            Duration::from_millis(execution.retry_max_delay_ms),
        )
        .with_breaker(BreakerConfig {
            failure_threshold: execution.breaker_failure_threshold,
            cooldown: Duration::from_millis(execution.breaker_cooldown_ms),
            ..BreakerConfig::default()
        });

    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::with_limits(
        config.session.max_sessions,
        config.session.max_history,
    ));
    let plan_timeout =
        (config.runtime.plan_timeout_ms > 0).then(|| Duration::from_millis(config.runtime.plan_timeout_ms));

    Ok(Orchestrator::new(
        registry.clone(),
        resolver,
        PlanBuilder::new(registry, gate),
        engine,
        store.clone(),
    )
    .with_context_source(Arc::new(SessionContextSource::new(store)))
    .with_config(OrchestratorConfig {
        session_policy,
        plan_timeout,
    }))
}

fn build_resolver(
    config: &ConductorConfig,
    registry: Arc<CapabilityRegistry>,
) -> Result<IntentResolver, BootstrapError> {
    let resolver = IntentResolver::new(registry, resolver_config(config));
    match config.resolver.mode.trim().to_ascii_lowercase().as_str() {
        "keyword" => Ok(resolver),
        "llm" => {
            let llm = config
                .resolver
                .llm
                .as_ref()
                .ok_or(BootstrapError::MissingLlmConfig)?;
            let mut client_config = HttpLlmClientConfig::for_base_url(&llm.base_url);
            client_config.timeout_secs = llm.timeout_secs;
            client_config.api_key = std::env::var(&llm.api_key_env)
                .ok()
                .filter(|key| !key.trim().is_empty());
            if client_config.api_key.is_none() {
                warn!(env = %llm.api_key_env, "classifier api key not set; requests may be rejected");
            }
            let classifier = LlmClassifier::new(
                HttpLlmClient::new(client_config)?,
                LlmClassifierConfig {
                    model: llm.model.clone(),
                    temperature: llm.temperature.unwrap_or(0.0),
                    max_context: config.resolver.context_limit,
                    ..LlmClassifierConfig::default()
                },
            );
            Ok(resolver.with_classifier(Arc::new(classifier)))
        }
        other => Err(BootstrapError::UnsupportedResolverMode(other.to_string())),
    }
}

/// Install the global subscriber once. `RUST_LOG` wins over the configured
/// level; `CONDUCTOR_LOG_FILE` wins over the configured file.
pub fn init_tracing_if_needed(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let log_file_path = std::env::var("CONDUCTOR_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| observability.log_file.clone());
        let file_writer = log_file_path.as_deref().and_then(open_log_file);
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };

        let make_filter = || {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        };

        match file_writer {
            Some(writer) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .try_init();
            }
        }
    });
}

fn open_log_file(path: &str) -> Option<std::sync::Mutex<std::fs::File>> {
    use std::fs::{create_dir_all, OpenOptions};
    use std::path::Path;

    let file_path = Path::new(path);
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = create_dir_all(parent) {
                eprintln!(
                    "failed to create log directory '{}': {}",
                    parent.display(),
                    err
                );
                return None;
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(file_path) {
        Ok(file) => Some(std::sync::Mutex::new(file)),
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            None
        }
    }
}
