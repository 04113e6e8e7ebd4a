use super::{InvocationSnapshot, PendingCall};
use crate::{
    address::AddressHolder,
    balancer::{LoadBalancer, WeightedCandidate},
    config::ConsumerConfig,
    connection::ConnectionHolder,
    errors::{FrameworkErrorKind, RpcError},
    filter::TerminalInvoker,
    metrics,
    router::RouterChain,
    stat::StatRegistry,
    types::{EndpointInfo, RpcRequest, RpcResponse},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Terminal invoker: routes, selects an endpoint, connects and sends.
///
/// Connection failures are retried against another endpoint up to `retries` times. Each failed
/// attempt is recorded against its endpoint and the endpoint is excluded for the rest of the
/// call. Synchronous calls wait for the send here; asynchronous calls leave the pending send in
/// the request's slot and return a placeholder response.
pub struct ClusterInvoker {
    consumer: Arc<ConsumerConfig>,
    consumer_id: Arc<str>,
    routers: RouterChain,
    addresses: Arc<AddressHolder>,
    holder: Arc<dyn ConnectionHolder>,
    balancer: Arc<dyn LoadBalancer>,
    stats: Arc<StatRegistry>,
    probe_share: f64,
}

impl ClusterInvoker {
    #[must_use]
    pub fn new(
        consumer: Arc<ConsumerConfig>,
        routers: RouterChain,
        addresses: Arc<AddressHolder>,
        holder: Arc<dyn ConnectionHolder>,
        balancer: Arc<dyn LoadBalancer>,
        stats: Arc<StatRegistry>,
    ) -> Self {
        let consumer_id = Arc::from(consumer.consumer_id());
        Self {
            consumer,
            consumer_id,
            routers,
            addresses,
            holder,
            balancer,
            stats,
            probe_share: 1.0,
        }
    }

    /// Share of its weight a recovering endpoint keeps during selection.
    #[must_use]
    pub fn with_probe_share(mut self, probe_share: f64) -> Self {
        self.probe_share = probe_share;
        self
    }

    #[must_use]
    pub fn routers(&self) -> &RouterChain {
        &self.routers
    }

    /// Runs the router chain and picks one endpoint among the selectable candidates.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Route`] when no candidate survives filtering.
    pub fn select(&self, request: &mut RpcRequest) -> Result<Arc<EndpointInfo>, RpcError> {
        request.route_record.clear();
        let routed = self.routers.route(request, &self.addresses);
        let routed_count = routed.len();

        let available: Vec<_> = routed
            .into_iter()
            .filter(|ep| ep.regulation_state().is_selectable())
            .filter(|ep| !request.excluded.contains(ep.key()))
            .collect();
        let candidates: Vec<_> = self
            .holder
            .narrow(available)
            .into_iter()
            .filter_map(|ep| WeightedCandidate::from_endpoint(ep, self.probe_share))
            .collect();

        let chosen = if candidates.is_empty() {
            None
        } else {
            self.balancer.select(request, &candidates)
        };
        chosen.ok_or_else(|| {
            metrics::record_route_failure(&self.consumer.service);
            let reason = if routed_count == 0 {
                "no endpoints routed".to_string()
            } else {
                format!("all {routed_count} routed endpoints are regulated or excluded")
            };
            debug!(consumer = %self.consumer_id, route = ?request.route_record, %reason, "route failed");
            RpcError::route(self.consumer.service.clone(), reason)
        })
    }

    fn retry_allowed(&self, error: &RpcError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.consumer.retries
    }
}

#[async_trait]
impl TerminalInvoker for ClusterInvoker {
    async fn invoke(&self, request: &mut RpcRequest) -> Result<RpcResponse, RpcError> {
        let asynchronous = request.invoke_type.is_async();
        if asynchronous && request.pending.is_none() {
            return Err(RpcError::framework(
                FrameworkErrorKind::Internal,
                "asynchronous call reached the cluster invoker without a pending slot",
            ));
        }

        let mut attempt = 0;
        let mut last_failure: Option<RpcError> = None;
        loop {
            let endpoint = match self.select(request) {
                Ok(endpoint) => endpoint,
                // A retry that finds nothing left to try reports why the earlier attempts failed.
                Err(route) => return Err(last_failure.unwrap_or(route)),
            };
            let stat = self.stats.stat_for(&self.consumer_id, &endpoint);

            let connection = match self.holder.get_connection(&endpoint).await {
                Ok(connection) => connection,
                Err(e) => {
                    stat.record(true);
                    if self.retry_allowed(&e, attempt) {
                        attempt += 1;
                        metrics::record_retry(&self.consumer.service);
                        warn!(endpoint = %endpoint.key(), attempt, error = %e, "connect failed, retrying");
                        request.excluded.push(endpoint.key().clone());
                        last_failure = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            };

            let mut outbound = request.clone();
            outbound.pending = None;
            let snapshot = InvocationSnapshot::capture(
                Arc::clone(&self.consumer),
                outbound.clone(),
                Arc::clone(&endpoint),
                stat,
            );
            let handle = tokio::spawn(async move { connection.send(outbound).await });
            let pending = PendingCall { snapshot, handle };

            if asynchronous {
                if let Some(slot) = &request.pending {
                    slot.fill(pending);
                }
                return Ok(RpcResponse::placeholder());
            }

            match pending.resolve(self.consumer.late_response_grace()).await {
                Err(e) if self.retry_allowed(&e, attempt) => {
                    attempt += 1;
                    metrics::record_retry(&self.consumer.service);
                    warn!(endpoint = %endpoint.key(), attempt, error = %e, "send failed on broken connection, retrying");
                    self.holder.remove_connection(endpoint.key()).await;
                    request.excluded.push(endpoint.key().clone());
                    last_failure = Some(e);
                }
                outcome => return outcome,
            }
        }
    }
}
