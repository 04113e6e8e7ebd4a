//! Endpoint selection among the surviving candidates.
//!
//! Regulated endpoints never reach a balancer. Recovering endpoints arrive with their weight
//! scaled down by the probe share, so every strategy gives them reduced traffic without knowing
//! about regulation.

use crate::types::{EndpointInfo, RegulationState, RpcRequest};
use rand::Rng;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A selectable endpoint with its weight after regulation adjustments.
#[derive(Debug, Clone)]
pub struct WeightedCandidate {
    pub endpoint: Arc<EndpointInfo>,
    pub effective_weight: u64,
}

impl WeightedCandidate {
    /// Derives the effective weight from the endpoint's current regulation state.
    ///
    /// Returns `None` for regulated endpoints.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn from_endpoint(endpoint: Arc<EndpointInfo>, probe_share: f64) -> Option<Self> {
        let weight = u64::from(endpoint.weight());
        let effective_weight = match endpoint.regulation_state() {
            RegulationState::Regulated => return None,
            RegulationState::Normal => weight,
            RegulationState::Recovering => ((weight as f64 * probe_share) as u64).max(1),
        };
        Some(Self { endpoint, effective_weight })
    }
}

/// Picks one endpoint from a non-empty candidate list.
pub trait LoadBalancer: Send + Sync {
    fn alias(&self) -> &'static str;

    /// Returns `None` only when `candidates` is empty.
    fn select(
        &self,
        request: &RpcRequest,
        candidates: &[WeightedCandidate],
    ) -> Option<Arc<EndpointInfo>>;
}

/// Maps `point` in `0..total` onto the candidate owning that slice of cumulative weight.
fn pick_by_weight(candidates: &[WeightedCandidate], mut point: u64) -> Option<Arc<EndpointInfo>> {
    for candidate in candidates {
        if point < candidate.effective_weight {
            return Some(Arc::clone(&candidate.endpoint));
        }
        point -= candidate.effective_weight;
    }
    candidates.last().map(|c| Arc::clone(&c.endpoint))
}

fn total_weight(candidates: &[WeightedCandidate]) -> u64 {
    candidates.iter().map(|c| c.effective_weight).sum()
}

/// Weighted random selection. Uniform when every weight is zero.
pub struct RandomLoadBalancer;

impl RandomLoadBalancer {
    pub const ALIAS: &'static str = "random";
}

impl LoadBalancer for RandomLoadBalancer {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    fn select(
        &self,
        _request: &RpcRequest,
        candidates: &[WeightedCandidate],
    ) -> Option<Arc<EndpointInfo>> {
        match candidates.len() {
            0 => None,
            1 => Some(Arc::clone(&candidates[0].endpoint)),
            len => {
                let total = total_weight(candidates);
                if total == 0 {
                    let index = rand::rng().random_range(0..len);
                    return Some(Arc::clone(&candidates[index].endpoint));
                }
                let point = rand::rng().random_range(0..total);
                pick_by_weight(candidates, point)
            }
        }
    }
}

/// Weighted round robin over cumulative weights, driven by a shared sequence.
#[derive(Default)]
pub struct RoundRobinLoadBalancer {
    sequence: AtomicU64,
}

impl RoundRobinLoadBalancer {
    pub const ALIAS: &'static str = "round_robin";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    #[allow(clippy::cast_possible_truncation)]
    fn select(
        &self,
        _request: &RpcRequest,
        candidates: &[WeightedCandidate],
    ) -> Option<Arc<EndpointInfo>> {
        if candidates.is_empty() {
            return None;
        }
        let tick = self.sequence.fetch_add(1, Ordering::Relaxed);
        let total = total_weight(candidates);
        if total == 0 {
            let index = (tick % candidates.len() as u64) as usize;
            return Some(Arc::clone(&candidates[index].endpoint));
        }
        pick_by_weight(candidates, tick % total)
    }
}
