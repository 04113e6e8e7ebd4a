use crate::{
    errors::{FrameworkErrorKind, RpcError},
    types::{RpcRequest, RpcResponse},
};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::oneshot;

type CallOutcome = Result<RpcResponse, RpcError>;

/// Completion handle of a future-mode call. Cloneable; every clone resolves to the same outcome.
#[derive(Clone)]
pub struct ResponseFuture {
    inner: Shared<BoxFuture<'static, CallOutcome>>,
}

impl ResponseFuture {
    /// A future resolved by the returned sender. Dropping the sender resolves it with an error.
    pub(crate) fn pending() -> (oneshot::Sender<CallOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        let inner = async move {
            rx.await.unwrap_or_else(|_| {
                Err(RpcError::framework(
                    FrameworkErrorKind::Internal,
                    "call completion dropped before delivering an outcome",
                ))
            })
        }
        .boxed()
        .shared();
        (tx, Self { inner })
    }

    /// An already completed future.
    #[must_use]
    pub fn ready(outcome: CallOutcome) -> Self {
        Self { inner: futures::future::ready(outcome).boxed().shared() }
    }

    /// The outcome, if the call has completed.
    #[must_use]
    pub fn peek(&self) -> Option<CallOutcome> {
        self.inner.peek().cloned()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// Waits at most `timeout` for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Timeout`] if the wait expires (the call itself keeps running), or the
    /// call's own error.
    pub async fn get(&self, timeout: Duration) -> CallOutcome {
        tokio::time::timeout(timeout, self.clone()).await.map_err(|_| RpcError::Timeout(timeout))?
    }
}

impl Future for ResponseFuture {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture").field("done", &self.is_done()).finish()
    }
}

/// Explicit per-caller context holding the most recent pending future.
///
/// Passed by reference into future-mode calls instead of living in task-local storage, so the
/// caller decides its scope.
#[derive(Debug, Default)]
pub struct CallContext {
    pending: Mutex<Option<ResponseFuture>>,
}

impl CallContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_future(&self, future: ResponseFuture) {
        *self.pending.lock() = Some(future);
    }

    /// # Errors
    ///
    /// Returns [`RpcError::NoPendingFuture`] if no future-mode call stored one.
    pub fn future(&self) -> Result<ResponseFuture, RpcError> {
        self.pending.lock().clone().ok_or(RpcError::NoPendingFuture)
    }

    /// Removes and returns the pending future.
    pub fn take_future(&self) -> Option<ResponseFuture> {
        self.pending.lock().take()
    }

    /// Waits for the pending call's outcome. With `clear`, the future is removed from the
    /// context first, so a later lookup finds nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NoPendingFuture`] if nothing is pending, [`RpcError::Timeout`] if
    /// the wait expires, or the call's own error.
    pub async fn get_response(&self, timeout: Duration, clear: bool) -> CallOutcome {
        let future = if clear { self.take_future() } else { self.pending.lock().clone() };
        future.ok_or(RpcError::NoPendingFuture)?.get(timeout).await
    }
}

/// Receives the outcome of a callback-mode call on the completing task.
pub trait ResponseCallback: Send + Sync {
    fn on_app_response(&self, response: RpcResponse, request: &RpcRequest);

    /// A business error reported by the callee ([`RpcError::Remote`]).
    fn on_app_exception(&self, error: RpcError, request: &RpcRequest);

    /// Any failure raised by the framework: timeout, connection, protocol or codec.
    fn on_framework_exception(&self, error: RpcError, request: &RpcRequest);
}

/// Routes an outcome to the matching callback method.
pub(crate) fn dispatch_callback(callback: &dyn ResponseCallback, outcome: CallOutcome, request: &RpcRequest) {
    match outcome {
        Ok(response) => callback.on_app_response(response, request),
        Err(error) if error.is_remote() => callback.on_app_exception(error, request),
        Err(error) => callback.on_framework_exception(error, request),
    }
}
