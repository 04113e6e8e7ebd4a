use super::{
    future::dispatch_callback, CallContext, PendingCall, PendingSlot, ResponseCallback,
    ResponseFuture,
};
use crate::{
    config::ConsumerConfig,
    errors::{FrameworkErrorKind, RpcError},
    filter::FilterChain,
    types::{InvokeType, RpcRequest, RpcResponse},
};
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::oneshot;
use tracing::debug;

/// Where an asynchronous outcome goes once the completion task has it.
enum Delivery {
    Future(oneshot::Sender<Result<RpcResponse, RpcError>>),
    Callback(Arc<dyn ResponseCallback>),
    Discard,
}

/// Entry point for calls to one consumer's service.
pub struct ClientProxyInvoker {
    consumer: Arc<ConsumerConfig>,
    chain: Arc<FilterChain>,
    next_request_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ClientProxyInvoker {
    #[must_use]
    pub fn new(consumer: Arc<ConsumerConfig>, chain: Arc<FilterChain>) -> Self {
        Self {
            consumer,
            chain,
            next_request_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn consumer(&self) -> &Arc<ConsumerConfig> {
        &self.consumer
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<FilterChain> {
        &self.chain
    }

    /// Stamps a new request with this consumer's service, timeout and default invoke type.
    pub fn build_request(&self, method: &str, payload: impl Into<Bytes>) -> RpcRequest {
        let mut request = RpcRequest::new(&self.consumer.service, method, payload)
            .with_timeout(self.consumer.timeout())
            .with_invoke_type(self.consumer.invoke_type);
        request.request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        request
    }

    /// Dispatches with the consumer's configured invoke type. Asynchronous modes return a
    /// placeholder response; the outcome of a future-mode call is stored in `context`.
    ///
    /// # Errors
    ///
    /// Returns the error of whichever stage failed.
    pub async fn dispatch(
        &self,
        request: RpcRequest,
        context: &CallContext,
    ) -> Result<RpcResponse, RpcError> {
        match request.invoke_type {
            InvokeType::Sync => self.invoke(request).await,
            InvokeType::Future => {
                self.invoke_future(request, context).await?;
                Ok(RpcResponse::placeholder())
            }
            InvokeType::Oneway => {
                self.invoke_oneway(request).await?;
                Ok(RpcResponse::placeholder())
            }
            InvokeType::Callback => Err(RpcError::framework(
                FrameworkErrorKind::Internal,
                "callback calls need a callback; use invoke_callback",
            )),
        }
    }

    /// Synchronous call: waits for the outcome or the request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ShuttingDown`] after shutdown, otherwise the call's error.
    pub async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.ensure_running()?;
        let mut request = request.with_invoke_type(InvokeType::Sync);
        request.pending = None;
        self.chain.invoke(&mut request).await
    }

    /// Future-mode call. Returns once the send is dispatched; the future is also stored in
    /// `context`.
    ///
    /// # Errors
    ///
    /// Returns errors raised before the send was dispatched (filters, routing, connect).
    pub async fn invoke_future(
        &self,
        request: RpcRequest,
        context: &CallContext,
    ) -> Result<ResponseFuture, RpcError> {
        let (tx, future) = ResponseFuture::pending();
        self.invoke_async(request, InvokeType::Future, Delivery::Future(tx)).await?;
        context.set_future(future.clone());
        Ok(future)
    }

    /// Callback-mode call. The callback runs on the completion task.
    ///
    /// # Errors
    ///
    /// Returns errors raised before the send was dispatched. Those never reach the callback.
    pub async fn invoke_callback(
        &self,
        request: RpcRequest,
        callback: Arc<dyn ResponseCallback>,
    ) -> Result<(), RpcError> {
        self.invoke_async(request, InvokeType::Callback, Delivery::Callback(callback)).await
    }

    /// Fire-and-forget call. The outcome is still recorded and shown to async-response filters.
    ///
    /// # Errors
    ///
    /// Returns errors raised before the send was dispatched.
    pub async fn invoke_oneway(&self, request: RpcRequest) -> Result<(), RpcError> {
        self.invoke_async(request, InvokeType::Oneway, Delivery::Discard).await
    }

    /// Rejects every later call with [`RpcError::ShuttingDown`].
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), RpcError> {
        if self.is_shutting_down() {
            return Err(RpcError::ShuttingDown);
        }
        Ok(())
    }

    async fn invoke_async(
        &self,
        request: RpcRequest,
        invoke_type: InvokeType,
        delivery: Delivery,
    ) -> Result<(), RpcError> {
        self.ensure_running()?;
        let slot = Arc::new(PendingSlot::default());
        let mut request = request.with_invoke_type(invoke_type);
        request.pending = Some(Arc::clone(&slot));

        let response = self.chain.invoke(&mut request).await;
        request.pending = None;

        match (slot.take(), response) {
            (Some(pending), _) => self.spawn_completion(request, pending, delivery),
            (None, Err(e)) => return Err(e),
            // A filter answered without reaching the cluster invoker.
            (None, Ok(response)) => {
                debug!(request_id = request.request_id, "asynchronous call answered inside the filter chain");
                deliver(delivery, Ok(response), &request);
            }
        }
        Ok(())
    }

    fn spawn_completion(&self, request: RpcRequest, pending: PendingCall, delivery: Delivery) {
        let chain = Arc::clone(&self.chain);
        let grace = self.consumer.late_response_grace();
        tokio::spawn(async move {
            let outcome = pending.resolve(grace).await;
            chain.notify_async(&request, outcome.as_ref().ok(), outcome.as_ref().err());
            deliver(delivery, outcome, &request);
        });
    }
}

fn deliver(delivery: Delivery, outcome: Result<RpcResponse, RpcError>, request: &RpcRequest) {
    match delivery {
        Delivery::Future(tx) => {
            if tx.send(outcome).is_err() {
                debug!(request_id = request.request_id, "response future dropped before completion");
            }
        }
        Delivery::Callback(callback) => dispatch_callback(callback.as_ref(), outcome, request),
        Delivery::Discard => {}
    }
}
