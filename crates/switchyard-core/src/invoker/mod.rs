//! Per-call dispatch.
//!
//! A call moves through these stages:
//!
//! ```text
//! BUILD_REQUEST -> FILTER_PRE -> ROUTE_AND_SELECT -> CONNECT -> SEND
//!     -> (SYNC_WAIT | ASYNC_PENDING) -> FILTER_POST -> RECORD_STAT -> RETURN
//! ```
//!
//! [`ClientProxyInvoker`] owns the first and last stages and the filter chain. At the bottom of
//! the chain, [`ClusterInvoker`] routes, selects, connects and spawns the send. The send always
//! runs on its own task so that a caller giving up never cancels the remote call.
//!
//! Everything a completion needs (consumer, target endpoint, stat handle, start time) is
//! captured into an [`InvocationSnapshot`] at send time and moved into whichever task finishes
//! the call. Nothing is looked up from ambient task or thread state.

mod cluster;
mod future;
mod proxy;

pub use cluster::ClusterInvoker;
pub use future::{CallContext, ResponseCallback, ResponseFuture};
pub use proxy::ClientProxyInvoker;

use crate::{
    config::ConsumerConfig,
    errors::{FrameworkErrorKind, RpcError},
    metrics,
    stat::InvocationStat,
    types::{EndpointInfo, RpcRequest, RpcResponse},
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tracing::{debug, warn};

/// Stand-in deadline for timeouts too large to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Call state captured when the request is handed to the transport.
#[derive(Debug, Clone)]
pub struct InvocationSnapshot {
    pub consumer: Arc<ConsumerConfig>,
    pub request: RpcRequest,
    pub endpoint: Arc<EndpointInfo>,
    pub started_at: Instant,
    pub timeout: Duration,
    stat: Arc<InvocationStat>,
}

impl InvocationSnapshot {
    pub(crate) fn capture(
        consumer: Arc<ConsumerConfig>,
        request: RpcRequest,
        endpoint: Arc<EndpointInfo>,
        stat: Arc<InvocationStat>,
    ) -> Self {
        let timeout = request.timeout;
        Self { consumer, request, endpoint, started_at: Instant::now(), timeout, stat }
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.started_at
            .checked_add(self.timeout)
            .or_else(|| self.started_at.checked_add(FAR_FUTURE))
            .unwrap_or(self.started_at)
    }

    fn classify(&self, outcome: &Result<RpcResponse, RpcError>) -> (bool, &'static str) {
        match outcome {
            Ok(_) => (false, "ok"),
            Err(e) => (e.counts_as_failure(self.consumer.remote_errors_as_failure), e.as_str()),
        }
    }

    /// Records the outcome against the target endpoint. Called exactly once per send.
    pub(crate) fn record(&self, outcome: &Result<RpcResponse, RpcError>) {
        let (failed, label) = self.classify(outcome);
        self.stat.record(failed);
        metrics::record_invocation(&self.consumer.service, label, self.started_at.elapsed());
    }

    /// Records an outcome that arrived after the caller's timeout was already recorded.
    pub(crate) fn record_late(&self, outcome: &Result<RpcResponse, RpcError>) {
        let (failed, _) = self.classify(outcome);
        self.stat.record_late(failed);
        metrics::record_late_response(&self.consumer.service);
    }
}

/// A send in flight, waiting for whoever completes the call.
pub(crate) struct PendingCall {
    pub(crate) snapshot: InvocationSnapshot,
    pub(crate) handle: JoinHandle<Result<RpcResponse, RpcError>>,
}

impl PendingCall {
    /// Waits for the send until the snapshot deadline and records the outcome.
    ///
    /// On timeout one failure is recorded immediately. The send keeps running under a detached
    /// watcher for at most `grace`. Whatever it yields later is recorded as a late sample and
    /// then discarded.
    pub(crate) async fn resolve(self, grace: Duration) -> Result<RpcResponse, RpcError> {
        let Self { snapshot, mut handle } = self;
        match tokio::time::timeout_at(snapshot.deadline(), &mut handle).await {
            Ok(joined) => {
                let outcome = flatten(joined);
                snapshot.record(&outcome);
                outcome
            }
            Err(_) => {
                let outcome = Err(RpcError::Timeout(snapshot.timeout));
                snapshot.record(&outcome);
                debug!(
                    request_id = snapshot.request.request_id,
                    endpoint = %snapshot.endpoint.key(),
                    timeout = ?snapshot.timeout,
                    "call timed out, remote call left running"
                );
                tokio::spawn(watch_late(snapshot, handle, grace));
                outcome
            }
        }
    }
}

async fn watch_late(
    snapshot: InvocationSnapshot,
    mut handle: JoinHandle<Result<RpcResponse, RpcError>>,
    grace: Duration,
) {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => {
            let outcome = flatten(joined);
            snapshot.record_late(&outcome);
            debug!(
                request_id = snapshot.request.request_id,
                endpoint = %snapshot.endpoint.key(),
                late_by = ?snapshot.deadline().elapsed(),
                ok = outcome.is_ok(),
                "late response recorded and discarded"
            );
        }
        Err(_) => {
            handle.abort();
            warn!(
                request_id = snapshot.request.request_id,
                endpoint = %snapshot.endpoint.key(),
                ?grace,
                "no response within grace period, send aborted"
            );
        }
    }
}

fn flatten(joined: Result<Result<RpcResponse, RpcError>, JoinError>) -> Result<RpcResponse, RpcError> {
    joined.unwrap_or_else(|e| {
        Err(RpcError::framework(FrameworkErrorKind::Internal, format!("send task failed: {e}")))
    })
}

/// Hand-off point between the cluster invoker and the proxy for asynchronous calls.
///
/// The proxy attaches an empty slot to the request; the cluster invoker fills it after spawning
/// the send. An empty slot after the chain returns means a filter answered without sending.
#[derive(Default)]
pub(crate) struct PendingSlot {
    call: Mutex<Option<PendingCall>>,
}

impl PendingSlot {
    pub(crate) fn fill(&self, call: PendingCall) {
        *self.call.lock() = Some(call);
    }

    pub(crate) fn take(&self) -> Option<PendingCall> {
        self.call.lock().take()
    }
}

impl fmt::Debug for PendingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSlot").field("filled", &self.call.lock().is_some()).finish()
    }
}
