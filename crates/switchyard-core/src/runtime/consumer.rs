//! One referenced service: addresses, connections and the call pipeline bound together.

use crate::{
    address::{AddressDiff, AddressHolder, EndpointListener},
    config::ConsumerConfig,
    connection::ConnectionHolder,
    errors::RpcError,
    invoker::{CallContext, ClientProxyInvoker, ResponseCallback, ResponseFuture},
    regulation::RegulatedConsumer,
    stat::StatRegistry,
    types::{EndpointInfo, EndpointKey, RpcRequest, RpcResponse},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Handle through which an application calls one referenced service.
///
/// Address pushes go through the `*_endpoints` methods. Connections follow automatically:
/// removed endpoints are disconnected and their statistics dropped, added endpoints are dialed
/// eagerly unless the consumer is lazy.
pub struct ConsumerClient {
    config: Arc<ConsumerConfig>,
    addresses: Arc<AddressHolder>,
    holder: Arc<dyn ConnectionHolder>,
    proxy: ClientProxyInvoker,
}

impl ConsumerClient {
    pub(super) fn new(
        config: Arc<ConsumerConfig>,
        addresses: Arc<AddressHolder>,
        holder: Arc<dyn ConnectionHolder>,
        proxy: ClientProxyInvoker,
    ) -> Self {
        Self { config, addresses, holder, proxy }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConsumerConfig> {
        &self.config
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.config.consumer_id()
    }

    #[must_use]
    pub fn addresses(&self) -> &Arc<AddressHolder> {
        &self.addresses
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<dyn ConnectionHolder> {
        &self.holder
    }

    #[must_use]
    pub fn proxy(&self) -> &ClientProxyInvoker {
        &self.proxy
    }

    pub async fn add_endpoints(&self, group: &str, endpoints: Vec<EndpointInfo>) -> AddressDiff {
        self.addresses.add_endpoints(group, endpoints).await
    }

    pub async fn remove_endpoints(&self, group: &str, keys: &[EndpointKey]) -> AddressDiff {
        self.addresses.remove_endpoints(group, keys).await
    }

    pub async fn update_endpoints(&self, group: &str, endpoints: Vec<EndpointInfo>) -> AddressDiff {
        self.addresses.update_endpoints(group, endpoints).await
    }

    pub async fn replace_all(&self, groups: BTreeMap<String, Vec<EndpointInfo>>) -> AddressDiff {
        self.addresses.replace_all(groups).await
    }

    pub fn build_request(&self, method: &str, payload: impl Into<Bytes>) -> RpcRequest {
        self.proxy.build_request(method, payload)
    }

    /// # Errors
    ///
    /// See [`ClientProxyInvoker::invoke`].
    pub async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.proxy.invoke(request).await
    }

    /// # Errors
    ///
    /// See [`ClientProxyInvoker::invoke_future`].
    pub async fn invoke_future(
        &self,
        request: RpcRequest,
        context: &CallContext,
    ) -> Result<ResponseFuture, RpcError> {
        self.proxy.invoke_future(request, context).await
    }

    /// # Errors
    ///
    /// See [`ClientProxyInvoker::invoke_callback`].
    pub async fn invoke_callback(
        &self,
        request: RpcRequest,
        callback: Arc<dyn ResponseCallback>,
    ) -> Result<(), RpcError> {
        self.proxy.invoke_callback(request, callback).await
    }

    /// # Errors
    ///
    /// See [`ClientProxyInvoker::invoke_oneway`].
    pub async fn invoke_oneway(&self, request: RpcRequest) -> Result<(), RpcError> {
        self.proxy.invoke_oneway(request).await
    }

    /// Rejects new calls and closes every connection. In-flight sends finish on their own.
    pub(super) async fn close(&self) {
        self.proxy.begin_shutdown();
        self.holder.close_all().await;
        debug!(consumer = self.id(), "consumer closed");
    }
}

#[async_trait]
impl RegulatedConsumer for ConsumerClient {
    fn consumer_id(&self) -> &str {
        self.config.consumer_id()
    }

    fn endpoints(&self) -> Vec<Arc<EndpointInfo>> {
        self.addresses.all_endpoints()
    }

    async fn release_connection(&self, key: &EndpointKey) {
        self.holder.remove_connection(key).await;
    }
}

/// Keeps the connection holder and statistics in step with address changes.
pub(super) struct AddressSync {
    consumer_id: Arc<str>,
    holder: Arc<dyn ConnectionHolder>,
    stats: Arc<StatRegistry>,
}

impl AddressSync {
    pub(super) fn new(consumer_id: &str, holder: Arc<dyn ConnectionHolder>, stats: Arc<StatRegistry>) -> Self {
        Self { consumer_id: Arc::from(consumer_id), holder, stats }
    }
}

#[async_trait]
impl EndpointListener for AddressSync {
    async fn on_added(&self, endpoints: &[Arc<EndpointInfo>]) {
        self.holder.on_endpoints_added(endpoints).await;
    }

    async fn on_removed(&self, keys: &[EndpointKey]) {
        self.holder.on_endpoints_removed(keys).await;
        self.stats.remove_endpoints(&self.consumer_id, keys);
    }
}
