//! Onion-ordered interceptors around the terminal invoker.
//!
//! A [`FilterChain`] is assembled once per consumer from the filters whose
//! [`Filter::need_to_load`] accepts it, sorted ascending by [`Filter::order`]. The lowest order
//! is the outermost layer: it sees the request first and the response last.
//!
//! Continuation is explicit. Each filter receives a [`Next`] cursor holding the remaining
//! filters and the terminal invoker, and calls [`Next::invoke`] to proceed. Returning without
//! calling it short-circuits every inner layer; returning an error propagates it outward
//! untouched.

mod builtin;

pub use builtin::{AccessLogFilter, RequestIdFilter, REQUEST_ID_HEADER};

use crate::{
    config::ConsumerConfig,
    errors::RpcError,
    extension::ExtensionRegistry,
    types::{RpcRequest, RpcResponse},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// An interceptor in the call path.
#[async_trait]
pub trait Filter: Send + Sync {
    fn alias(&self) -> &'static str;

    /// Position in the chain. Lower runs first on the way in.
    fn order(&self) -> i32;

    /// Decides once, at chain construction, whether this filter applies to a consumer.
    fn need_to_load(&self, _consumer: &ConsumerConfig) -> bool {
        true
    }

    /// Handles one call. Must call `next.invoke(request)` to continue the chain.
    ///
    /// # Errors
    ///
    /// Any error aborts the remaining inner layers and propagates to the caller.
    async fn invoke(
        &self,
        request: &mut RpcRequest,
        next: Next<'_>,
    ) -> Result<RpcResponse, RpcError>;

    /// Observes the completion of an asynchronous call, in chain order, on the completing task.
    ///
    /// # Errors
    ///
    /// Errors are logged by the chain and never reach the caller.
    fn on_async_response(
        &self,
        _consumer: &ConsumerConfig,
        _request: &RpcRequest,
        _response: Option<&RpcResponse>,
        _error: Option<&RpcError>,
    ) -> Result<(), RpcError> {
        Ok(())
    }
}

/// The innermost layer: routing, connection and send.
#[async_trait]
pub trait TerminalInvoker: Send + Sync {
    /// # Errors
    ///
    /// Returns the call outcome error.
    async fn invoke(&self, request: &mut RpcRequest) -> Result<RpcResponse, RpcError>;
}

/// Cursor over the rest of the chain.
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    index: usize,
    terminal: &'a dyn TerminalInvoker,
}

impl<'a> Next<'a> {
    /// Invokes the next filter, or the terminal invoker when none remain.
    ///
    /// # Errors
    ///
    /// Propagates the error of whichever layer produced it.
    pub async fn invoke(self, request: &mut RpcRequest) -> Result<RpcResponse, RpcError> {
        match self.filters.get(self.index) {
            Some(filter) => {
                let next = Next { filters: self.filters, index: self.index + 1, terminal: self.terminal };
                filter.invoke(request, next).await
            }
            None => self.terminal.invoke(request).await,
        }
    }

    /// Number of filters still ahead of the terminal invoker.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.filters.len().saturating_sub(self.index)
    }
}

/// Immutable, ordered filter pipeline for one consumer.
pub struct FilterChain {
    consumer: Arc<ConsumerConfig>,
    filters: Vec<Arc<dyn Filter>>,
    terminal: Arc<dyn TerminalInvoker>,
}

impl FilterChain {
    /// Builds the chain from explicit filter instances.
    ///
    /// Filters whose predicate rejects the consumer are dropped; the rest are stable-sorted by
    /// order, so equal orders keep their given sequence.
    #[must_use]
    pub fn new(
        consumer: Arc<ConsumerConfig>,
        filters: Vec<Arc<dyn Filter>>,
        terminal: Arc<dyn TerminalInvoker>,
    ) -> Self {
        let mut active: Vec<_> = filters
            .into_iter()
            .filter(|f| {
                let load = f.need_to_load(&consumer);
                if !load {
                    debug!(filter = f.alias(), consumer = consumer.consumer_id(), "filter not loaded");
                }
                load
            })
            .collect();
        active.sort_by_key(|f| f.order());
        Self { consumer, filters: active, terminal }
    }

    /// Builds the chain from the aliases the consumer names, or every registered filter when
    /// the list is empty.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError`](crate::extension::ExtensionError) for an unknown alias.
    pub fn build(
        consumer: Arc<ConsumerConfig>,
        registry: &ExtensionRegistry,
        terminal: Arc<dyn TerminalInvoker>,
    ) -> Result<Self, crate::extension::ExtensionError> {
        let filters = if consumer.filters.is_empty() {
            registry
                .filter_aliases()
                .into_iter()
                .map(|alias| registry.resolve_filter(alias))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            consumer
                .filters
                .iter()
                .map(|alias| registry.resolve_filter(alias))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self::new(consumer, filters, terminal))
    }

    /// Runs the request through every filter and the terminal invoker.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any layer.
    pub async fn invoke(&self, request: &mut RpcRequest) -> Result<RpcResponse, RpcError> {
        Next { filters: &self.filters, index: 0, terminal: self.terminal.as_ref() }
            .invoke(request)
            .await
    }

    /// Delivers an asynchronous completion to every filter in chain order.
    ///
    /// Filter errors are logged and swallowed; the outcome itself is never altered.
    pub fn notify_async(
        &self,
        request: &RpcRequest,
        response: Option<&RpcResponse>,
        error: Option<&RpcError>,
    ) {
        for filter in &self.filters {
            if let Err(e) = filter.on_async_response(&self.consumer, request, response, error) {
                warn!(
                    filter = filter.alias(),
                    request_id = request.request_id,
                    error = %e,
                    "async response observer failed"
                );
            }
        }
    }

    /// Aliases of the active filters in execution order.
    #[must_use]
    pub fn aliases(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.alias()).collect()
    }

    #[must_use]
    pub fn consumer(&self) -> &Arc<ConsumerConfig> {
        &self.consumer
    }
}
