//! Builder pattern for initializing the dispatch runtime with configurable components.

use crate::{
    config::AppConfig,
    extension::{ExtensionError, ExtensionRegistry},
    regulation::RegulationLoop,
    stat::StatRegistry,
    transport::Transport,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{lifecycle::DispatchRuntime, RuntimeComponents};

/// Errors raised while building the runtime or managing its consumers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// No transport was supplied
    #[error("No transport configured")]
    MissingTransport,

    /// An extension alias could not be resolved or rejected the consumer
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("Consumer already referenced: {0}")]
    DuplicateConsumer(String),

    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    #[error("Runtime is shutting down")]
    ShuttingDown,

    /// Generic initialization error
    #[error("Runtime initialization failed: {0}")]
    Initialization(String),
}

/// Configuration options for the runtime builder.
#[derive(Clone)]
pub(super) struct RuntimeOptions {
    pub(super) enable_regulation: bool,
    pub(super) enable_health_checks: bool,
    pub(super) shutdown_channel_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { enable_regulation: true, enable_health_checks: true, shutdown_channel_capacity: 16 }
    }
}

/// Builder for constructing a [`DispatchRuntime`].
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use switchyard_core::{config::AppConfig, runtime::DispatchRuntimeBuilder, transport::LoopbackTransport};
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = DispatchRuntimeBuilder::new()
///     .with_config(AppConfig::load()?)
///     .with_transport(Arc::new(LoopbackTransport::new()))
///     .disable_health_checks()
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct DispatchRuntimeBuilder {
    config: Option<AppConfig>,
    transport: Option<Arc<dyn Transport>>,
    extensions: Option<ExtensionRegistry>,
    options: RuntimeOptions,
}

impl DispatchRuntimeBuilder {
    /// Creates a new runtime builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self { config: None, transport: None, extensions: None, options: RuntimeOptions::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the built-in extension registry.
    #[must_use]
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Runs the regulation loop when the configuration has a `[regulation]` section (default).
    #[must_use]
    pub fn enable_regulation(mut self) -> Self {
        self.options.enable_regulation = true;
        self
    }

    /// Never regulates, even when thresholds are configured.
    #[must_use]
    pub fn disable_regulation(mut self) -> Self {
        self.options.enable_regulation = false;
        self
    }

    /// Starts a connection health checker per consumer (default).
    #[must_use]
    pub fn enable_health_checks(mut self) -> Self {
        self.options.enable_health_checks = true;
        self
    }

    #[must_use]
    pub fn disable_health_checks(mut self) -> Self {
        self.options.enable_health_checks = false;
        self
    }

    /// Sets custom shutdown channel capacity (default: 16).
    #[must_use]
    pub fn with_shutdown_channel_capacity(mut self, capacity: usize) -> Self {
        self.options.shutdown_channel_capacity = capacity;
        self
    }

    /// Builds the runtime and starts the regulation loop. Consumers are referenced afterwards.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if configuration or transport is missing, configuration is
    /// invalid, or the configured regulator alias is unknown.
    pub fn build(self) -> Result<DispatchRuntime, RuntimeError> {
        let config = self.config.ok_or_else(|| {
            RuntimeError::ConfigValidation("No configuration provided".to_string())
        })?;
        config.validate().map_err(RuntimeError::ConfigValidation)?;
        let transport = self.transport.ok_or(RuntimeError::MissingTransport)?;
        if self.options.shutdown_channel_capacity == 0 {
            return Err(RuntimeError::Initialization(
                "shutdown channel capacity must be positive".to_string(),
            ));
        }

        let regulation_config =
            config.regulation.clone().filter(|_| self.options.enable_regulation);
        info!(
            consumers_count = config.consumers.len(),
            regulation_enabled = regulation_config.is_some(),
            health_checks_enabled = self.options.enable_health_checks,
            "Initializing dispatch runtime"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(self.options.shutdown_channel_capacity);
        let extensions = Arc::new(self.extensions.unwrap_or_else(ExtensionRegistry::with_defaults));
        debug!(extensions = ?extensions, "Extension registry ready");

        let history = regulation_config.as_ref().map_or(0, |r| r.history_windows);
        let stats = Arc::new(StatRegistry::new(history));

        let regulation = match regulation_config {
            Some(regulation_config) => {
                let regulator =
                    extensions.resolve_regulator(&regulation_config.regulator, &regulation_config)?;
                debug!(regulator = regulator.alias(), "Regulation loop initialized");
                Some(Arc::new(RegulationLoop::new(regulation_config, regulator, Arc::clone(&stats))))
            }
            None => {
                debug!("Regulation disabled");
                None
            }
        };

        let components = RuntimeComponents::new(extensions, transport, stats, regulation);
        let runtime = DispatchRuntime::new(components, shutdown_tx, config, self.options);

        info!("Dispatch runtime initialization complete");
        Ok(runtime)
    }
}

impl Default for DispatchRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
