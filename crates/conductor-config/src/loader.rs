//! Configuration loading and hot-reload support.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use crate::{CapabilitiesConfig, ConductorConfig, IDENTITY_KINDS, PARAM_KINDS};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("file watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load full Conductor configuration from YAML file.
pub fn load_config(path: &Path) -> Result<ConductorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ConductorConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &ConductorConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    if !matches!(config.runtime.session_policy.as_str(), "supersede" | "queue") {
        return Err(ConfigError::Invalid(format!(
            "runtime.session_policy '{}' must be 'supersede' or 'queue'",
            config.runtime.session_policy
        )));
    }

    if config.runtime.plan_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "runtime.plan_timeout_ms must be > 0".to_string(),
        ));
    }

    if config.runtime.expiry_sweep_ms == 0 {
        return Err(ConfigError::Invalid(
            "runtime.expiry_sweep_ms must be > 0".to_string(),
        ));
    }

    if !matches!(config.resolver.mode.as_str(), "keyword" | "llm") {
        return Err(ConfigError::Invalid(format!(
            "resolver.mode '{}' must be 'keyword' or 'llm'",
            config.resolver.mode
        )));
    }

    if !(0.0..=1.0).contains(&config.resolver.confidence_threshold) {
        return Err(ConfigError::Invalid(
            "resolver.confidence_threshold must be within [0, 1]".to_string(),
        ));
    }

    if config.resolver.mode == "llm" {
        match &config.resolver.llm {
            Some(llm) if !llm.model.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "resolver.llm.model is required when resolver.mode is 'llm'".to_string(),
                ))
            }
        }
    }

    let execution = &config.execution;
    if execution.max_in_flight == 0 {
        return Err(ConfigError::Invalid(
            "execution.max_in_flight must be > 0".to_string(),
        ));
    }
    if execution.read_only_timeout_ms == 0 || execution.mutating_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "execution timeouts must be > 0".to_string(),
        ));
    }
    if execution.breaker_failure_threshold == 0 {
        return Err(ConfigError::Invalid(
            "execution.breaker_failure_threshold must be > 0".to_string(),
        ));
    }

    if config.confirmation.window_secs == 0 {
        return Err(ConfigError::Invalid(
            "confirmation.window_secs must be > 0".to_string(),
        ));
    }

    if config.session.max_history == 0 || config.session.max_sessions == 0 {
        return Err(ConfigError::Invalid(
            "session limits must be > 0".to_string(),
        ));
    }

    validate_capabilities(&config.capabilities)?;

    for name in &config.confirmation.auto_approve {
        if config.capabilities.get(name).is_none() {
            return Err(ConfigError::Invalid(format!(
                "confirmation.auto_approve references unknown capability '{}'",
                name
            )));
        }
    }

    Ok(())
}

fn validate_capabilities(config: &CapabilitiesConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for spec in &config.catalog {
        if spec.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "capability name must not be empty".to_string(),
            ));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate capability name '{}'",
                spec.name
            )));
        }

        let mut params = HashSet::new();
        for param in &spec.parameters {
            if param.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "capability '{}' has a parameter with an empty name",
                    spec.name
                )));
            }
            if !params.insert(param.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "capability '{}' declares parameter '{}' twice",
                    spec.name, param.name
                )));
            }
            if !PARAM_KINDS.contains(&param.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "capability '{}' parameter '{}' has unknown kind '{}'",
                    spec.name, param.name, param.kind
                )));
            }
        }

        if let Some(provider) = &spec.identity_provider {
            if !IDENTITY_KINDS.contains(&provider.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "capability '{}' identity_provider.kind '{}' is not a known identity kind",
                    spec.name, provider.kind
                )));
            }
            if !params.contains(provider.input_param.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "capability '{}' identity_provider.input_param '{}' is not a declared parameter",
                    spec.name, provider.input_param
                )));
            }
            if provider.output_key.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "capability '{}' identity_provider.output_key must not be empty",
                    spec.name
                )));
            }
        }

        if matches!(&spec.auth_provider, Some(p) if p.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "capability '{}' auth_provider must not be empty",
                spec.name
            )));
        }
        if spec.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "capability '{}' timeout_ms must be > 0",
                spec.name
            )));
        }
    }
    Ok(())
}

/// Manages unified configuration with hot-reload support.
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<ConductorConfig>>,
    /// Bumped after every successful load
    generation: watch::Sender<u64>,
}

impl ConfigManager {
    /// Create a new config manager.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            path: path.into(),
            config: Arc::new(RwLock::new(ConductorConfig::default())),
            generation,
        }
    }

    /// Get a reference to the current config.
    pub fn config(&self) -> Arc<RwLock<ConductorConfig>> {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receiver that changes whenever a new config has been loaded
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Load configuration from file. An invalid file leaves the current config in place.
    pub async fn load(&self) -> Result<(), ConfigError> {
        let config = load_config(&self.path)?;
        {
            let mut current = self.config.write().await;
            *current = config;
        }
        self.generation.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Start watching for config file changes.
    pub fn start_watching(self: &Arc<Self>) -> Result<ConfigWatcher, ConfigError> {
        let manager = Arc::clone(self);
        let handle = tokio::runtime::Handle::current();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let manager = Arc::clone(&manager);
                        handle.spawn(async move {
                            if let Err(e) = manager.load().await {
                                tracing::error!("failed to reload config: {}", e);
                            } else {
                                tracing::info!("config reloaded");
                            }
                        });
                    }
                }
            })?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        Ok(ConfigWatcher { _watcher: watcher })
    }
}

/// Keeps the file watcher alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}
