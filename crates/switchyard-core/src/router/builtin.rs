use super::{RouteDecision, Router};
use crate::{
    address::{AddressHolder, DEFAULT_GROUP, DIRECT_GROUP},
    config::ConsumerConfig,
    extension::ExtensionError,
    types::{EndpointInfo, RpcRequest},
};
use std::{collections::HashSet, sync::Arc};

/// Uses only the consumer's fixed `direct_url` endpoints and ignores every other source.
pub struct DirectUrlRouter;

impl DirectUrlRouter {
    pub const ALIAS: &'static str = "direct";
}

impl Router for DirectUrlRouter {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    fn order(&self) -> i32 {
        -20_000
    }

    fn need_to_load(&self, consumer: &ConsumerConfig) -> Result<bool, ExtensionError> {
        Ok(consumer.direct_url.as_deref().is_some_and(|url| !url.trim().is_empty()))
    }

    fn route(
        &self,
        request: &mut RpcRequest,
        addresses: &AddressHolder,
        _candidates: Vec<Arc<EndpointInfo>>,
    ) -> RouteDecision {
        request.route_record.push(Self::ALIAS);
        RouteDecision::ShortCircuit(addresses.get_endpoints(DIRECT_GROUP))
    }
}

/// Supplies registry-discovered endpoints from the default group when nothing upstream did.
pub struct RegistryRouter;

impl RegistryRouter {
    pub const ALIAS: &'static str = "registry";
}

impl Router for RegistryRouter {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    fn order(&self) -> i32 {
        -19_000
    }

    fn need_to_load(&self, consumer: &ConsumerConfig) -> Result<bool, ExtensionError> {
        Ok(consumer.direct_url.is_none())
    }

    fn route(
        &self,
        request: &mut RpcRequest,
        addresses: &AddressHolder,
        candidates: Vec<Arc<EndpointInfo>>,
    ) -> RouteDecision {
        if !candidates.is_empty() {
            return RouteDecision::Continue(candidates);
        }
        let discovered = addresses.get_endpoints(DEFAULT_GROUP);
        if !discovered.is_empty() {
            request.route_record.push(Self::ALIAS);
        }
        RouteDecision::Continue(discovered)
    }
}

/// Falls back to the union of every address group when earlier routers found nothing.
pub struct MergeGroupsRouter;

impl MergeGroupsRouter {
    pub const ALIAS: &'static str = "merge_groups";
}

impl Router for MergeGroupsRouter {
    fn alias(&self) -> &'static str {
        Self::ALIAS
    }

    fn order(&self) -> i32 {
        -18_000
    }

    fn need_to_load(&self, consumer: &ConsumerConfig) -> Result<bool, ExtensionError> {
        Ok(consumer.merge_groups_on_empty)
    }

    fn route(
        &self,
        request: &mut RpcRequest,
        addresses: &AddressHolder,
        candidates: Vec<Arc<EndpointInfo>>,
    ) -> RouteDecision {
        if !candidates.is_empty() {
            return RouteDecision::Continue(candidates);
        }
        let groups = addresses.snapshot();
        let mut seen = HashSet::new();
        let merged: Vec<_> = groups
            .values()
            .flat_map(|group| group.endpoints().iter())
            .filter(|ep| seen.insert(ep.key().clone()))
            .cloned()
            .collect();
        if !merged.is_empty() {
            request.route_record.push(Self::ALIAS);
        }
        RouteDecision::Continue(merged)
    }
}
