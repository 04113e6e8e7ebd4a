//! In-process transport.
//!
//! Every endpoint answers from a configurable [`LoopbackBehavior`] instead of a socket. Dials and
//! sends are counted per endpoint, and established links can be severed to simulate dead
//! connections. Used by integration tests and the `probe` command.

use super::{Connection, Transport};
use crate::{
    errors::{FrameworkErrorKind, RpcError},
    types::{EndpointInfo, EndpointKey, RpcRequest, RpcResponse},
};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

pub const SERVED_BY_HEADER: &str = "x-served-by";

/// How a loopback endpoint answers.
#[derive(Debug, Clone, Default)]
pub enum LoopbackBehavior {
    /// Return the request payload and headers, plus [`SERVED_BY_HEADER`].
    #[default]
    Echo,
    /// Fail every send with this error.
    Fail(RpcError),
    /// Fail with a protocol error with the given probability, echo otherwise.
    FailRatio(f64),
    /// Wait, then behave like the inner behavior.
    Delay(Duration, Box<LoopbackBehavior>),
    /// Reject dials.
    Refuse,
}

#[derive(Default)]
struct LoopbackState {
    behaviors: DashMap<EndpointKey, LoopbackBehavior>,
    dials: DashMap<EndpointKey, u64>,
    sends: DashMap<EndpointKey, u64>,
    links: DashMap<EndpointKey, Vec<Arc<AtomicBool>>>,
    dial_delay_ms: AtomicU64,
}

impl LoopbackState {
    fn behavior(&self, key: &EndpointKey) -> LoopbackBehavior {
        self.behaviors.get(key).map(|b| b.value().clone()).unwrap_or_default()
    }
}

/// Transport that serves every endpoint in-process.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<LoopbackState>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every dial take `delay` before completing.
    #[must_use]
    pub fn with_dial_delay(self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.dial_delay_ms.store(millis, Ordering::Relaxed);
        self
    }

    pub fn set_behavior(&self, key: &EndpointKey, behavior: LoopbackBehavior) {
        self.state.behaviors.insert(key.clone(), behavior);
    }

    pub fn reset_behavior(&self, key: &EndpointKey) {
        self.state.behaviors.remove(key);
    }

    #[must_use]
    pub fn dial_count(&self, key: &EndpointKey) -> u64 {
        self.state.dials.get(key).map_or(0, |c| *c)
    }

    #[must_use]
    pub fn send_count(&self, key: &EndpointKey) -> u64 {
        self.state.sends.get(key).map_or(0, |c| *c)
    }

    /// Number of connections to `key` that are still open.
    #[must_use]
    pub fn open_connections(&self, key: &EndpointKey) -> usize {
        self.state
            .links
            .get(key)
            .map_or(0, |links| links.iter().filter(|l| l.load(Ordering::Acquire)).count())
    }

    /// Marks every open connection to `key` as dead without telling its holder.
    pub fn sever(&self, key: &EndpointKey) {
        if let Some(links) = self.state.links.get(key) {
            for link in links.iter() {
                link.store(false, Ordering::Release);
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        endpoint: &EndpointInfo,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        let key = endpoint.key().clone();
        *self.state.dials.entry(key.clone()).or_insert(0) += 1;

        let delay = Duration::from_millis(self.state.dial_delay_ms.load(Ordering::Relaxed));
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(RpcError::connection(&key, format!("connect timed out after {timeout:?}")));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if matches!(self.state.behavior(&key), LoopbackBehavior::Refuse) {
            return Err(RpcError::connection(&key, "connection refused"));
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.state.links.entry(key.clone()).or_default().push(Arc::clone(&alive));
        Ok(Arc::new(LoopbackConnection { key, alive, state: Arc::clone(&self.state) }))
    }
}

struct LoopbackConnection {
    key: EndpointKey,
    alive: Arc<AtomicBool>,
    state: Arc<LoopbackState>,
}

impl LoopbackConnection {
    fn echo(&self, request: &RpcRequest) -> RpcResponse {
        let mut response = RpcResponse::new(request.payload.clone());
        response.headers.clone_from(&request.headers);
        response.with_header(SERVED_BY_HEADER, &self.key.to_string())
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn endpoint(&self) -> &EndpointKey {
        &self.key
    }

    async fn send(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        if !self.is_alive() {
            return Err(RpcError::connection(&self.key, "connection closed"));
        }
        *self.state.sends.entry(self.key.clone()).or_insert(0) += 1;

        let mut behavior = self.state.behavior(&self.key);
        loop {
            match behavior {
                LoopbackBehavior::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    behavior = *inner;
                }
                LoopbackBehavior::Echo => return Ok(self.echo(&request)),
                LoopbackBehavior::Fail(error) => return Err(error),
                LoopbackBehavior::FailRatio(ratio) => {
                    let fail = rand::rng().random_bool(ratio.clamp(0.0, 1.0));
                    if fail {
                        return Err(RpcError::framework(
                            FrameworkErrorKind::Protocol,
                            format!("injected failure from {}", self.key),
                        ));
                    }
                    return Ok(self.echo(&request));
                }
                LoopbackBehavior::Refuse => {
                    return Err(RpcError::connection(&self.key, "connection reset"));
                }
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
