use super::{ConnectionHolder, HealthReport};
use crate::{
    errors::RpcError,
    metrics,
    transport::{Connection, Transport},
    types::{EndpointInfo, EndpointKey},
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type ConnectionCell = Arc<OnceCell<Arc<dyn Connection>>>;

/// Holds one connection per endpoint that has been demanded (or announced, when eager).
///
/// Each endpoint maps to a [`OnceCell`]: the first caller runs the dial while every concurrent
/// caller awaits the same cell. A failed dial leaves the cell empty so the next demand retries.
///
/// Only announced endpoints are dialed. A caller that selected an endpoint just before its
/// removal gets a connection error instead of a connection nobody would close.
pub struct AllConnectionHolder {
    consumer_id: Arc<str>,
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    lazy: bool,
    live: DashSet<EndpointKey>,
    cells: DashMap<EndpointKey, ConnectionCell>,
}

impl AllConnectionHolder {
    #[must_use]
    pub fn new(
        consumer_id: &str,
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        lazy: bool,
    ) -> Self {
        Self {
            consumer_id: Arc::from(consumer_id),
            transport,
            connect_timeout,
            lazy,
            live: DashSet::new(),
            cells: DashMap::new(),
        }
    }

    fn cell_for(&self, key: &EndpointKey) -> ConnectionCell {
        Arc::clone(self.cells.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())).value())
    }

    fn is_current(&self, key: &EndpointKey, cell: &ConnectionCell) -> bool {
        self.cells.get(key).is_some_and(|current| Arc::ptr_eq(current.value(), cell))
    }

    async fn evict_if_current(&self, key: &EndpointKey, cell: &ConnectionCell) -> bool {
        let removed = self.cells.remove_if(key, |_, current| Arc::ptr_eq(current, cell));
        match removed {
            Some((_, cell)) => {
                if let Some(conn) = cell.get() {
                    conn.close().await;
                }
                true
            }
            None => false,
        }
    }

    async fn dial(&self, endpoint: &EndpointInfo) -> Result<Arc<dyn Connection>, RpcError> {
        let attempt = self.transport.connect(endpoint, self.connect_timeout);
        let result = match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::connection(
                endpoint.key(),
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        };
        match &result {
            Ok(_) => {
                metrics::record_dial(true);
                debug!(consumer = %self.consumer_id, endpoint = %endpoint.key(), "connection established");
            }
            Err(e) => {
                metrics::record_dial(false);
                warn!(consumer = %self.consumer_id, endpoint = %endpoint.key(), error = %e, "connect failed");
            }
        }
        result
    }

    /// Endpoints with an established connection, live or not.
    #[must_use]
    pub fn connected_keys(&self) -> Vec<EndpointKey> {
        self.cells
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Marks endpoints as current addresses without dialing them.
    pub(crate) fn admit(&self, endpoints: &[Arc<EndpointInfo>]) {
        for ep in endpoints {
            self.live.insert(ep.key().clone());
        }
    }

    /// Dials every endpoint concurrently, logging failures.
    pub(crate) async fn warm_up(&self, endpoints: &[Arc<EndpointInfo>]) {
        let attempts = endpoints.iter().map(|ep| self.get_connection(ep));
        let failures = join_all(attempts).await.into_iter().filter(Result::is_err).count();
        if failures > 0 {
            warn!(consumer = %self.consumer_id, failures, "eager connect left endpoints unconnected");
        }
    }
}

#[async_trait]
impl ConnectionHolder for AllConnectionHolder {
    async fn get_connection(
        &self,
        endpoint: &Arc<EndpointInfo>,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        let key = endpoint.key();
        for _ in 0..2 {
            if !self.live.contains(key) {
                return Err(RpcError::connection(key, "endpoint is no longer a current address"));
            }
            let cell = self.cell_for(key);
            let conn = Arc::clone(cell.get_or_try_init(|| self.dial(endpoint)).await?);

            // Removal clears the live key before the cell, so one of the two checks sees it.
            if !self.live.contains(key) {
                if !self.evict_if_current(key, &cell).await {
                    conn.close().await;
                }
                return Err(RpcError::connection(key, "endpoint removed while connecting"));
            }
            if !self.is_current(key, &cell) {
                conn.close().await;
                return Err(RpcError::connection(key, "endpoint removed while connecting"));
            }
            if conn.is_alive() {
                return Ok(conn);
            }
            debug!(consumer = %self.consumer_id, endpoint = %key, "evicting dead connection");
            self.evict_if_current(key, &cell).await;
        }
        Err(RpcError::connection(key, "no live connection after reconnect"))
    }

    async fn remove_connection(&self, key: &EndpointKey) {
        if let Some((_, cell)) = self.cells.remove(key) {
            if let Some(conn) = cell.get() {
                conn.close().await;
                debug!(consumer = %self.consumer_id, endpoint = %key, "connection closed");
            }
        }
    }

    async fn on_endpoints_added(&self, endpoints: &[Arc<EndpointInfo>]) {
        self.admit(endpoints);
        if !self.lazy {
            self.warm_up(endpoints).await;
        }
    }

    async fn on_endpoints_removed(&self, keys: &[EndpointKey]) {
        for key in keys {
            self.live.remove(key);
        }
        for key in keys {
            self.remove_connection(key).await;
        }
    }

    async fn check_health(&self) -> HealthReport {
        let established: Vec<(EndpointKey, ConnectionCell)> = self
            .cells
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut report = HealthReport { checked: established.len(), evicted: 0 };
        for (key, cell) in established {
            let dead = cell.get().is_some_and(|conn| !conn.is_alive());
            if dead && self.evict_if_current(&key, &cell).await {
                report.evicted += 1;
                warn!(consumer = %self.consumer_id, endpoint = %key, "dead connection evicted");
            }
        }
        report
    }

    fn active_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|entry| entry.value().get().is_some_and(|conn| conn.is_alive()))
            .count()
    }

    async fn close_all(&self) {
        let keys: Vec<EndpointKey> = self.cells.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.remove_connection(&key).await;
        }
    }
}
