use super::{AllConnectionHolder, ConnectionHolder, HealthReport};
use crate::{
    errors::RpcError,
    transport::Connection,
    types::{EndpointInfo, EndpointKey},
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

/// Keeps connections to a bounded subset of the known endpoints.
///
/// The subset size is `max(min_count, ceil(n * percent / 100))`, capped at `n`. Members are kept
/// across rebalances when possible; vacancies are filled in the order endpoints became known.
///
/// Connections to endpoints outside the subset only exist while no member is usable for a call.
/// They are closed on the next rebalance or health sweep.
pub struct ElasticConnectionHolder {
    inner: AllConnectionHolder,
    percent: u32,
    min_count: usize,
    lazy: bool,
    known: Mutex<Vec<Arc<EndpointInfo>>>,
    held: ArcSwap<BTreeSet<EndpointKey>>,
}

struct Rebalance {
    joined: Vec<Arc<EndpointInfo>>,
    dropped: Vec<EndpointKey>,
}

impl ElasticConnectionHolder {
    #[must_use]
    pub fn new(inner: AllConnectionHolder, percent: u32, min_count: usize, lazy: bool) -> Self {
        Self {
            inner,
            percent: percent.min(100),
            min_count,
            lazy,
            known: Mutex::new(Vec::new()),
            held: ArcSwap::from_pointee(BTreeSet::new()),
        }
    }

    /// Subset size for `known` endpoints.
    #[must_use]
    pub fn target(&self, known: usize) -> usize {
        let share = (known * self.percent as usize).div_ceil(100);
        share.max(self.min_count).min(known)
    }

    /// Keys of the endpoints currently in the held subset.
    #[must_use]
    pub fn held(&self) -> Vec<EndpointKey> {
        self.held.load().iter().cloned().collect()
    }

    fn rebalance(&self, known: &[Arc<EndpointInfo>]) -> Rebalance {
        let target = self.target(known.len());
        let current = self.held.load_full();

        let mut next = BTreeSet::new();
        for ep in known.iter().filter(|ep| current.contains(ep.key())) {
            if next.len() == target {
                break;
            }
            next.insert(ep.key().clone());
        }
        let mut joined = Vec::new();
        for ep in known {
            if next.len() == target {
                break;
            }
            if next.insert(ep.key().clone()) {
                joined.push(Arc::clone(ep));
            }
        }

        let dropped = current.difference(&next).cloned().collect();
        self.held.store(Arc::new(next));
        Rebalance { joined, dropped }
    }

    async fn apply(&self, change: Rebalance) {
        if !change.joined.is_empty() || !change.dropped.is_empty() {
            debug!(
                joined = change.joined.len(),
                dropped = change.dropped.len(),
                held = self.held.load().len(),
                "elastic subset rebalanced"
            );
        }
        if !self.lazy {
            self.inner.warm_up(&change.joined).await;
        }
        for key in &change.dropped {
            self.inner.remove_connection(key).await;
        }
        self.release_unheld().await;
    }

    /// Closes connections to endpoints outside the held subset. Returns how many were closed.
    async fn release_unheld(&self) -> usize {
        let held = self.held.load_full();
        let extra: Vec<EndpointKey> =
            self.inner.connected_keys().into_iter().filter(|key| !held.contains(key)).collect();
        for key in &extra {
            self.inner.remove_connection(key).await;
        }
        if !extra.is_empty() {
            debug!(released = extra.len(), "closed connections outside the elastic subset");
        }
        extra.len()
    }
}

#[async_trait]
impl ConnectionHolder for ElasticConnectionHolder {
    async fn get_connection(
        &self,
        endpoint: &Arc<EndpointInfo>,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        self.inner.get_connection(endpoint).await
    }

    async fn remove_connection(&self, key: &EndpointKey) {
        self.inner.remove_connection(key).await;
    }

    async fn on_endpoints_added(&self, endpoints: &[Arc<EndpointInfo>]) {
        self.inner.admit(endpoints);
        let change = {
            let mut known = self.known.lock();
            for ep in endpoints {
                match known.iter_mut().find(|k| k.key() == ep.key()) {
                    Some(existing) => *existing = Arc::clone(ep),
                    None => known.push(Arc::clone(ep)),
                }
            }
            self.rebalance(&known)
        };
        self.apply(change).await;
    }

    async fn on_endpoints_removed(&self, keys: &[EndpointKey]) {
        let change = {
            let mut known = self.known.lock();
            known.retain(|ep| !keys.contains(ep.key()));
            self.rebalance(&known)
        };
        self.apply(change).await;
        self.inner.on_endpoints_removed(keys).await;
    }

    fn narrow(&self, candidates: Vec<Arc<EndpointInfo>>) -> Vec<Arc<EndpointInfo>> {
        let held = self.held.load();
        let subset: Vec<_> =
            candidates.iter().filter(|ep| held.contains(ep.key())).cloned().collect();
        if subset.is_empty() {
            candidates
        } else {
            subset
        }
    }

    async fn check_health(&self) -> HealthReport {
        let report = self.inner.check_health().await;
        self.release_unheld().await;
        report
    }

    fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    async fn close_all(&self) {
        self.inner.close_all().await;
    }
}
