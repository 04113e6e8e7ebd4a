//! Shared fixtures for integration tests.
//!
//! ## Usage
//!
//! ```ignore
//! use tests::support::{endpoint, key, TestHarness};
//!
//! let harness = TestHarness::new(None);
//! let client = harness.refer(ConsumerConfig::new("svc")).await;
//! client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;
//! ```

mod filters;

pub use filters::{CallJournal, HeaderStamp, JournalFilter, RejectingFilter};

use std::{sync::Arc, time::Duration};
use switchyard_core::{
    config::{AppConfig, ConsumerConfig, RegulationConfig},
    extension::ExtensionRegistry,
    runtime::{ConsumerClient, DispatchRuntime},
    transport::LoopbackTransport,
    types::{EndpointInfo, EndpointKey},
};

/// Loopback endpoint identity on port 1.
#[must_use]
pub fn key(host: &str) -> EndpointKey {
    EndpointKey::new("tcp", host, 1, "default")
}

#[must_use]
pub fn endpoint(host: &str, weight: u32) -> EndpointInfo {
    EndpointInfo::new(key(host), weight)
}

/// Regulation thresholds for tests. The loop period is long so only manual ticks run.
#[must_use]
pub fn manual_regulation(degrade: Duration, recovery_window: Duration) -> RegulationConfig {
    let mut config =
        RegulationConfig::new(Duration::from_secs(3600), 10, 0.5, degrade, 2.0, 0.5);
    config.recovery_window_ms = Some(u64::try_from(recovery_window.as_millis()).unwrap_or(u64::MAX));
    config.recovery_min_samples = Some(5);
    config
}

/// A runtime over a loopback transport the test can script.
pub struct TestHarness {
    pub runtime: DispatchRuntime,
    pub transport: LoopbackTransport,
}

impl TestHarness {
    /// Builds a runtime without health checkers.
    ///
    /// # Panics
    ///
    /// Panics if the runtime cannot be built.
    #[must_use]
    pub fn new(regulation: Option<RegulationConfig>) -> Self {
        Self::with_extensions(regulation, ExtensionRegistry::with_defaults())
    }

    /// # Panics
    ///
    /// Panics if the runtime cannot be built.
    #[must_use]
    pub fn with_extensions(regulation: Option<RegulationConfig>, extensions: ExtensionRegistry) -> Self {
        let transport = LoopbackTransport::new();
        let runtime = DispatchRuntime::builder()
            .with_config(AppConfig { regulation, ..Default::default() })
            .with_transport(Arc::new(transport.clone()))
            .with_extensions(extensions)
            .disable_health_checks()
            .build()
            .expect("runtime builds");
        Self { runtime, transport }
    }

    /// # Panics
    ///
    /// Panics if the consumer is rejected.
    pub async fn refer(&self, consumer: ConsumerConfig) -> Arc<ConsumerClient> {
        self.runtime.refer(consumer).await.expect("consumer referenced")
    }
}

/// A consumer that spreads calls evenly over equal-weight endpoints.
#[must_use]
pub fn round_robin_consumer(service: &str) -> ConsumerConfig {
    let mut consumer = ConsumerConfig::new(service);
    consumer.load_balancer = "round_robin".to_string();
    consumer
}
