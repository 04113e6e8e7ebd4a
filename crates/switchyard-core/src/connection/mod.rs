//! Connection ownership.
//!
//! A [`ConnectionHolder`] owns every live connection of one consumer, keyed by endpoint
//! identity. Creation is idempotent: concurrent demand for an endpoint that has no connection
//! yet produces one dial and one connection object, which every waiter shares.

mod all;
mod elastic;
mod health;

pub use all::AllConnectionHolder;
pub use elastic::ElasticConnectionHolder;
pub use health::ConnectionHealthChecker;

use crate::{
    config::{ConnectionConfig, HolderKind},
    errors::RpcError,
    transport::{Connection, Transport},
    types::{EndpointInfo, EndpointKey},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Result of one liveness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub evicted: usize,
}

#[async_trait]
pub trait ConnectionHolder: Send + Sync {
    /// Returns the live connection for `endpoint`, dialing it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`] if the dial fails, or if the endpoint is not a current
    /// address (never announced, or removed before or during the dial).
    async fn get_connection(
        &self,
        endpoint: &Arc<EndpointInfo>,
    ) -> Result<Arc<dyn Connection>, RpcError>;

    /// Closes and forgets the connection for `key`, if any.
    async fn remove_connection(&self, key: &EndpointKey);

    async fn on_endpoints_added(&self, endpoints: &[Arc<EndpointInfo>]);

    async fn on_endpoints_removed(&self, keys: &[EndpointKey]);

    /// Restricts candidates to those this holder prefers to use. Never returns an empty list
    /// for a non-empty input.
    fn narrow(&self, candidates: Vec<Arc<EndpointInfo>>) -> Vec<Arc<EndpointInfo>> {
        candidates
    }

    /// Evicts dead connections. They are re-dialed on next demand.
    async fn check_health(&self) -> HealthReport;

    fn active_count(&self) -> usize;

    async fn close_all(&self);
}

/// Builds the holder named by `config.holder`.
#[must_use]
pub fn holder_for(
    consumer_id: &str,
    config: &ConnectionConfig,
    transport: Arc<dyn Transport>,
) -> Arc<dyn ConnectionHolder> {
    let all = AllConnectionHolder::new(consumer_id, transport, config.connect_timeout(), config.lazy);
    match config.holder {
        HolderKind::All => Arc::new(all),
        HolderKind::Elastic => Arc::new(ElasticConnectionHolder::new(
            all,
            config.elastic_percent,
            config.elastic_min_count,
            config.lazy,
        )),
    }
}
