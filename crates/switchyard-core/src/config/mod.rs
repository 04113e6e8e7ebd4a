//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `set_default` entries and `#[serde(default)]` functions
//! 2. **Config file**: TOML file named by the `SWITCHYARD_CONFIG` env var
//! 3. **Environment variables**: `SWITCHYARD__SECTION__FIELD` overrides
//!
//! # Configuration Sections
//!
//! - [`LoggingConfig`]: log level and format
//! - [`RegulationConfig`]: thresholds for the endpoint regulation loop (optional)
//! - [`ConsumerConfig`]: one entry per referenced service
//!
//! Regulation thresholds have no compiled defaults. A deployment that wants regulation must
//! state window length, sample floor, exception ratio, degrade duration, escalation factor and
//! probe share explicitly; omitting the `[regulation]` section disables the loop.
//!
//! # Example
//!
//! ```toml
//! [regulation]
//! window_ms = 10000
//! min_sample_threshold = 10
//! regulation_threshold = 0.5
//! degrade_duration_ms = 30000
//! escalation_factor = 2.0
//! probe_share = 0.1
//!
//! [[consumers]]
//! service = "com.example.OrderService"
//! timeout_ms = 2000
//! retries = 1
//!
//! [consumers.connection]
//! holder = "elastic"
//! elastic_percent = 30
//! ```

use crate::types::InvokeType;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Whether regulation decisions are applied or only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegulationMode {
    #[default]
    Enforce,
    /// Decisions are logged but endpoint state never changes.
    Observe,
}

/// Thresholds and policy for the endpoint regulation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulationConfig {
    /// Statistics window length and loop period, in milliseconds.
    pub window_ms: u64,

    /// Minimum invocations within one window before the exception ratio is trusted.
    pub min_sample_threshold: u64,

    /// Exception ratio in `(0, 1]` at or above which an endpoint is regulated.
    pub regulation_threshold: f64,

    /// Time an endpoint stays regulated before probing starts, in milliseconds.
    pub degrade_duration_ms: u64,

    /// Multiplier applied to the degrade duration each time recovery fails. Must be `>= 1`.
    pub escalation_factor: f64,

    /// Fraction of its static weight a recovering endpoint receives, in `(0, 1]`.
    pub probe_share: f64,

    /// Regulator extension alias. Defaults to `"exception_ratio"`.
    #[serde(default = "default_regulator")]
    pub regulator: String,

    #[serde(default)]
    pub mode: RegulationMode,

    /// Upper bound for escalated degrade durations. Unbounded when absent.
    #[serde(default)]
    pub max_degrade_duration_ms: Option<u64>,

    /// Probe invocations needed before recovery can fail early. Defaults to
    /// `min_sample_threshold`.
    #[serde(default)]
    pub recovery_min_samples: Option<u64>,

    /// Length of the probe phase. Defaults to `window_ms`.
    #[serde(default)]
    pub recovery_window_ms: Option<u64>,

    /// Allows the last selectable endpoint of a consumer to be regulated.
    #[serde(default)]
    pub allow_regulate_all: bool,

    /// Maximum number of endpoints regulated at once per consumer.
    #[serde(default)]
    pub max_regulated_count: Option<usize>,

    /// Closes held connections to an endpoint when it is regulated. Defaults to `true`.
    #[serde(default = "default_true")]
    pub close_connection_on_regulation: bool,

    /// Number of past windows retained per stat for inspection. Defaults to `6`.
    #[serde(default = "default_history_windows")]
    pub history_windows: usize,
}

fn default_regulator() -> String {
    "exception_ratio".to_string()
}

fn default_true() -> bool {
    true
}

fn default_history_windows() -> usize {
    6
}

impl RegulationConfig {
    /// Builds a config from the required thresholds; every optional knob takes its default.
    #[must_use]
    pub fn new(
        window: Duration,
        min_sample_threshold: u64,
        regulation_threshold: f64,
        degrade_duration: Duration,
        escalation_factor: f64,
        probe_share: f64,
    ) -> Self {
        Self {
            window_ms: duration_ms(window),
            min_sample_threshold,
            regulation_threshold,
            degrade_duration_ms: duration_ms(degrade_duration),
            escalation_factor,
            probe_share,
            regulator: default_regulator(),
            mode: RegulationMode::Enforce,
            max_degrade_duration_ms: None,
            recovery_min_samples: None,
            recovery_window_ms: None,
            allow_regulate_all: false,
            max_regulated_count: None,
            close_connection_on_regulation: true,
            history_windows: default_history_windows(),
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    #[must_use]
    pub fn degrade_duration(&self) -> Duration {
        Duration::from_millis(self.degrade_duration_ms)
    }

    #[must_use]
    pub fn max_degrade_duration(&self) -> Option<Duration> {
        self.max_degrade_duration_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn recovery_min_samples(&self) -> u64 {
        self.recovery_min_samples.unwrap_or(self.min_sample_threshold)
    }

    #[must_use]
    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms.unwrap_or(self.window_ms))
    }

    /// Degrade duration after `strikes` failed recoveries, capped by `max_degrade_duration_ms`.
    #[must_use]
    pub fn escalated_degrade(&self, strikes: u32) -> Duration {
        let exponent = i32::try_from(strikes).unwrap_or(i32::MAX);
        let mut secs = self.degrade_duration().as_secs_f64() * self.escalation_factor.powi(exponent);
        if let Some(cap) = self.max_degrade_duration() {
            secs = secs.min(cap.as_secs_f64());
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Validates thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error message describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_ms == 0 {
            return Err("regulation.window_ms must be greater than 0".to_string());
        }
        if self.min_sample_threshold == 0 {
            return Err("regulation.min_sample_threshold must be greater than 0".to_string());
        }
        if !(self.regulation_threshold > 0.0 && self.regulation_threshold <= 1.0) {
            return Err("regulation.regulation_threshold must be in (0, 1]".to_string());
        }
        if self.degrade_duration_ms == 0 {
            return Err("regulation.degrade_duration_ms must be greater than 0".to_string());
        }
        if !(self.escalation_factor >= 1.0 && self.escalation_factor.is_finite()) {
            return Err("regulation.escalation_factor must be a finite value >= 1".to_string());
        }
        if !(self.probe_share > 0.0 && self.probe_share <= 1.0) {
            return Err("regulation.probe_share must be in (0, 1]".to_string());
        }
        if let Some(max) = self.max_degrade_duration_ms {
            if max < self.degrade_duration_ms {
                return Err(
                    "regulation.max_degrade_duration_ms must be >= degrade_duration_ms".to_string()
                );
            }
        }
        if self.max_regulated_count == Some(0) {
            return Err("regulation.max_regulated_count must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Connection holder sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolderKind {
    /// One connection per known endpoint.
    #[default]
    All,
    /// A bounded subset of the known endpoints.
    Elastic,
}

/// Per-consumer connection management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Dial on first demand instead of on endpoint arrival. Defaults to `true`.
    #[serde(default = "default_true")]
    pub lazy: bool,

    #[serde(default)]
    pub holder: HolderKind,

    /// Percentage of known endpoints the elastic holder keeps connected. Defaults to `50`.
    #[serde(default = "default_elastic_percent")]
    pub elastic_percent: u32,

    /// Lower bound on held connections for the elastic holder. Defaults to `1`.
    #[serde(default = "default_elastic_min_count")]
    pub elastic_min_count: usize,

    /// Liveness check period in milliseconds. Defaults to `30000`.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Dial timeout in milliseconds. Defaults to `1000`.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_elastic_percent() -> u32 {
    50
}

fn default_elastic_min_count() -> usize {
    1
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            lazy: true,
            holder: HolderKind::All,
            elastic_percent: default_elastic_percent(),
            elastic_min_count: default_elastic_min_count(),
            health_check_interval_ms: default_health_check_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration of one referenced service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Unique consumer id. Defaults to the service name.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default = "default_app")]
    pub app: String,

    pub service: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_serialization")]
    pub serialization: String,

    /// Fixed endpoint list (`,` or `;` separated). Bypasses registry-sourced addresses.
    #[serde(default)]
    pub direct_url: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra attempts on connection failure. Defaults to `0`.
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub invoke_type: InvokeType,

    #[serde(default = "default_load_balancer")]
    pub load_balancer: String,

    /// Router aliases to load. Empty means every registered router whose predicate accepts.
    #[serde(default)]
    pub routers: Vec<String>,

    /// Filter aliases to load. Empty means every registered filter whose predicate accepts.
    #[serde(default)]
    pub filters: Vec<String>,

    /// Count callee-reported errors as failures in invocation statistics.
    #[serde(default)]
    pub remote_errors_as_failure: bool,

    /// Fall back to the union of all address groups when routing finds nothing.
    #[serde(default)]
    pub merge_groups_on_empty: bool,

    /// How long a timed-out call is watched for a late response, in milliseconds.
    #[serde(default = "default_late_response_grace_ms")]
    pub late_response_grace_ms: u64,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

fn default_app() -> String {
    "default".to_string()
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_serialization() -> String {
    crate::types::DEFAULT_SERIALIZATION.to_string()
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_load_balancer() -> String {
    "random".to_string()
}

fn default_late_response_grace_ms() -> u64 {
    30_000
}

impl ConsumerConfig {
    /// Creates a consumer config for `service` with every other field at its default.
    #[must_use]
    pub fn new(service: &str) -> Self {
        Self {
            id: None,
            app: default_app(),
            service: service.to_string(),
            protocol: default_protocol(),
            serialization: default_serialization(),
            direct_url: None,
            timeout_ms: default_timeout_ms(),
            retries: 0,
            invoke_type: InvokeType::Sync,
            load_balancer: default_load_balancer(),
            routers: Vec::new(),
            filters: Vec::new(),
            remote_errors_as_failure: false,
            merge_groups_on_empty: false,
            late_response_grace_ms: default_late_response_grace_ms(),
            connection: ConnectionConfig::default(),
        }
    }

    #[must_use]
    pub fn consumer_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.service)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn late_response_grace(&self) -> Duration {
        Duration::from_millis(self.late_response_grace_ms)
    }

    /// Validates consumer settings.
    ///
    /// # Errors
    ///
    /// Returns an error message describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.service.trim().is_empty() {
            return Err("consumer.service cannot be empty".to_string());
        }
        if self.timeout_ms == 0 {
            return Err(format!("consumer {}: timeout_ms must be greater than 0", self.service));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(format!(
                "consumer {}: connection.connect_timeout_ms must be greater than 0",
                self.service
            ));
        }
        if self.connection.health_check_interval_ms == 0 {
            return Err(format!(
                "consumer {}: connection.health_check_interval_ms must be greater than 0",
                self.service
            ));
        }
        if self.connection.holder == HolderKind::Elastic &&
            (self.connection.elastic_percent == 0 || self.connection.elastic_percent > 100)
        {
            return Err(format!(
                "consumer {}: connection.elastic_percent must be in 1..=100",
                self.service
            ));
        }
        if let Some(direct) = &self.direct_url {
            crate::types::EndpointInfo::parse_list(direct)
                .map_err(|e| format!("consumer {}: invalid direct_url: {e}", self.service))?;
        }
        Ok(())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Regulation loop settings. Regulation is disabled when absent.
    #[serde(default)]
    pub regulation: Option<RegulationConfig>,

    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
}

impl AppConfig {
    /// Loads configuration from a specific file path with environment variable overrides.
    ///
    /// Environment variables with the `SWITCHYARD__` prefix can override any configuration
    /// value, e.g. `SWITCHYARD__REGULATION__PROBE_SHARE=0.2`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("SWITCHYARD").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/switchyard.toml` with fallback to defaults.
    ///
    /// The config file path can be overridden using the `SWITCHYARD_CONFIG` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("SWITCHYARD_CONFIG")
            .unwrap_or_else(|_| "config/switchyard.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates every section and rejects duplicate consumer ids.
    ///
    /// # Errors
    ///
    /// Returns an error message describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(format!("logging.format must be json or pretty, got {other}")),
        }
        if let Some(regulation) = &self.regulation {
            regulation.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for consumer in &self.consumers {
            consumer.validate()?;
            if !seen.insert(consumer.consumer_id()) {
                return Err(format!("duplicate consumer id: {}", consumer.consumer_id()));
            }
        }
        Ok(())
    }
}
