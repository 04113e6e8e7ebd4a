//! Transport seam.
//!
//! Wire protocols live outside this crate. The dispatch engine only needs to dial an endpoint,
//! send a request over the resulting connection and ask whether the connection is still alive.

mod loopback;

pub use loopback::{LoopbackBehavior, LoopbackTransport, SERVED_BY_HEADER};

use crate::{
    errors::RpcError,
    types::{EndpointInfo, EndpointKey, RpcRequest, RpcResponse},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

/// Dials endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection to `endpoint`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`] if the endpoint cannot be reached.
    async fn connect(
        &self,
        endpoint: &EndpointInfo,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, RpcError>;
}

/// A live transport handle bound to one endpoint. Shared by every call routed to it.
#[async_trait]
pub trait Connection: Send + Sync {
    fn endpoint(&self) -> &EndpointKey;

    /// Sends one request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Remote`] for callee-reported failures, [`RpcError::Framework`] for
    /// codec or protocol faults and [`RpcError::Connection`] if the link broke mid-call.
    async fn send(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;

    fn is_alive(&self) -> bool;

    async fn close(&self);
}
