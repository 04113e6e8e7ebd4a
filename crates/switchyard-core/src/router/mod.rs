//! Candidate resolution.
//!
//! A [`RouterChain`] is the ordered list of routing strategies that applies to one consumer.
//! Starting from an empty list, each router receives the candidates produced so far and returns
//! a [`RouteDecision`]: either the list to hand to the next router, or a final list that stops
//! the chain. Applicability is decided once when the chain is built; routing itself never
//! fails, it can only produce an empty list.

mod builtin;

pub use builtin::{DirectUrlRouter, MergeGroupsRouter, RegistryRouter};

use crate::{
    address::AddressHolder,
    config::ConsumerConfig,
    extension::{ExtensionError, ExtensionRegistry},
    types::{EndpointInfo, RpcRequest},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a router decided for the candidate list.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Pass the list to the next router.
    Continue(Vec<Arc<EndpointInfo>>),
    /// Use this list as the final result.
    ShortCircuit(Vec<Arc<EndpointInfo>>),
}

/// A routing strategy.
pub trait Router: Send + Sync {
    fn alias(&self) -> &'static str;

    /// Position in the chain. Lower runs first.
    fn order(&self) -> i32;

    /// Decides whether this router applies to a consumer.
    ///
    /// # Errors
    ///
    /// An error means the router could not decide. The chain treats it as "not applicable".
    fn need_to_load(&self, consumer: &ConsumerConfig) -> Result<bool, ExtensionError>;

    fn route(
        &self,
        request: &mut RpcRequest,
        addresses: &AddressHolder,
        candidates: Vec<Arc<EndpointInfo>>,
    ) -> RouteDecision;
}

/// A router admitted to a consumer's chain.
#[derive(Clone)]
pub struct RouterEntry {
    router: Arc<dyn Router>,
    order: i32,
}

impl RouterEntry {
    #[must_use]
    pub fn alias(&self) -> &'static str {
        self.router.alias()
    }

    #[must_use]
    pub fn order(&self) -> i32 {
        self.order
    }
}

/// Immutable router pipeline for one consumer.
#[derive(Clone, Default)]
pub struct RouterChain {
    entries: Vec<RouterEntry>,
}

impl RouterChain {
    /// Admits the routers whose predicate accepts `consumer`, ordered by `(order, alias)`.
    #[must_use]
    pub fn new(consumer: &ConsumerConfig, routers: Vec<Arc<dyn Router>>) -> Self {
        let mut entries: Vec<RouterEntry> = routers
            .into_iter()
            .filter(|router| match router.need_to_load(consumer) {
                Ok(load) => load,
                Err(e) => {
                    warn!(
                        router = router.alias(),
                        consumer = consumer.consumer_id(),
                        error = %e,
                        "router predicate failed, treating as not applicable"
                    );
                    false
                }
            })
            .map(|router| RouterEntry { order: router.order(), router })
            .collect();
        entries.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.alias().cmp(b.alias())));
        debug!(
            consumer = consumer.consumer_id(),
            routers = ?entries.iter().map(RouterEntry::alias).collect::<Vec<_>>(),
            "router chain built"
        );
        Self { entries }
    }

    /// Resolves the consumer's router aliases, or every registered router when none are named.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::UnknownAlias`] for an unregistered alias.
    pub fn build(
        consumer: &ConsumerConfig,
        registry: &ExtensionRegistry,
    ) -> Result<Self, ExtensionError> {
        let routers = if consumer.routers.is_empty() {
            registry
                .router_aliases()
                .into_iter()
                .map(|alias| registry.resolve_router(alias))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            consumer
                .routers
                .iter()
                .map(|alias| registry.resolve_router(alias))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self::new(consumer, routers))
    }

    /// Runs every router in order and returns the final candidate list.
    pub fn route(
        &self,
        request: &mut RpcRequest,
        addresses: &AddressHolder,
    ) -> Vec<Arc<EndpointInfo>> {
        let mut candidates = Vec::new();
        for entry in &self.entries {
            match entry.router.route(request, addresses, candidates) {
                RouteDecision::Continue(next) => candidates = next,
                RouteDecision::ShortCircuit(last) => return last,
            }
        }
        candidates
    }

    #[must_use]
    pub fn aliases(&self) -> Vec<&'static str> {
        self.entries.iter().map(RouterEntry::alias).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
