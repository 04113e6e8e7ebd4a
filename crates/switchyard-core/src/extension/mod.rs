//! Typed extension registry.
//!
//! Pluggable strategies (routers, filters, load balancers, regulators) are looked up by the
//! alias a consumer's configuration names. Every kind has its own constructor table, so a
//! lookup can never hand back the wrong trait object. The registry is owned by the dispatch
//! runtime; nothing is global.

use crate::{
    balancer::{LoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer},
    config::RegulationConfig,
    filter::{AccessLogFilter, Filter, RequestIdFilter},
    regulation::{ExceptionRatioRegulator, Regulator},
    router::{DirectUrlRouter, MergeGroupsRouter, RegistryRouter, Router},
};
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;

type RouterCtor = Arc<dyn Fn() -> Arc<dyn Router> + Send + Sync>;
type FilterCtor = Arc<dyn Fn() -> Arc<dyn Filter> + Send + Sync>;
type BalancerCtor = Arc<dyn Fn() -> Arc<dyn LoadBalancer> + Send + Sync>;
type RegulatorCtor = Arc<dyn Fn(&RegulationConfig) -> Arc<dyn Regulator> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Router,
    Filter,
    LoadBalancer,
    Regulator,
}

impl ExtensionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Filter => "filter",
            Self::LoadBalancer => "load_balancer",
            Self::Regulator => "regulator",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while resolving or evaluating extensions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExtensionError {
    /// No constructor registered under this alias.
    #[error("Unknown {kind} extension: {alias}")]
    UnknownAlias { kind: ExtensionKind, alias: String },

    /// An extension could not decide whether it applies to a consumer.
    #[error("{kind} {alias} cannot evaluate consumer {consumer}: {reason}")]
    Predicate { kind: ExtensionKind, alias: String, consumer: String, reason: String },
}

/// Constructor tables for every extension kind, keyed by alias.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    routers: HashMap<&'static str, RouterCtor>,
    filters: HashMap<&'static str, FilterCtor>,
    balancers: HashMap<&'static str, BalancerCtor>,
    regulators: HashMap<&'static str, RegulatorCtor>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry populated with the built-in strategies.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register_router(DirectUrlRouter::ALIAS, || Arc::new(DirectUrlRouter))
            .register_router(RegistryRouter::ALIAS, || Arc::new(RegistryRouter))
            .register_router(MergeGroupsRouter::ALIAS, || Arc::new(MergeGroupsRouter))
            .register_filter(RequestIdFilter::ALIAS, || Arc::new(RequestIdFilter))
            .register_filter(AccessLogFilter::ALIAS, || Arc::new(AccessLogFilter))
            .register_load_balancer(RandomLoadBalancer::ALIAS, || Arc::new(RandomLoadBalancer))
            .register_load_balancer(RoundRobinLoadBalancer::ALIAS, || {
                Arc::new(RoundRobinLoadBalancer::new())
            })
            .register_regulator(ExceptionRatioRegulator::ALIAS, |config| {
                Arc::new(ExceptionRatioRegulator::new(config.clone()))
            });
        registry
    }

    /// Registers a router constructor, replacing any previous one under the same alias.
    pub fn register_router<F>(&mut self, alias: &'static str, ctor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Router> + Send + Sync + 'static,
    {
        self.routers.insert(alias, Arc::new(ctor));
        self
    }

    pub fn register_filter<F>(&mut self, alias: &'static str, ctor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Filter> + Send + Sync + 'static,
    {
        self.filters.insert(alias, Arc::new(ctor));
        self
    }

    pub fn register_load_balancer<F>(&mut self, alias: &'static str, ctor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn LoadBalancer> + Send + Sync + 'static,
    {
        self.balancers.insert(alias, Arc::new(ctor));
        self
    }

    pub fn register_regulator<F>(&mut self, alias: &'static str, ctor: F) -> &mut Self
    where
        F: Fn(&RegulationConfig) -> Arc<dyn Regulator> + Send + Sync + 'static,
    {
        self.regulators.insert(alias, Arc::new(ctor));
        self
    }

    /// # Errors
    ///
    /// Returns [`ExtensionError::UnknownAlias`] if no router is registered under `alias`.
    pub fn resolve_router(&self, alias: &str) -> Result<Arc<dyn Router>, ExtensionError> {
        self.routers
            .get(alias)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown(ExtensionKind::Router, alias))
    }

    /// # Errors
    ///
    /// Returns [`ExtensionError::UnknownAlias`] if no filter is registered under `alias`.
    pub fn resolve_filter(&self, alias: &str) -> Result<Arc<dyn Filter>, ExtensionError> {
        self.filters
            .get(alias)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown(ExtensionKind::Filter, alias))
    }

    /// # Errors
    ///
    /// Returns [`ExtensionError::UnknownAlias`] if no load balancer is registered under `alias`.
    pub fn resolve_load_balancer(
        &self,
        alias: &str,
    ) -> Result<Arc<dyn LoadBalancer>, ExtensionError> {
        self.balancers
            .get(alias)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown(ExtensionKind::LoadBalancer, alias))
    }

    /// # Errors
    ///
    /// Returns [`ExtensionError::UnknownAlias`] if no regulator is registered under `alias`.
    pub fn resolve_regulator(
        &self,
        alias: &str,
        config: &RegulationConfig,
    ) -> Result<Arc<dyn Regulator>, ExtensionError> {
        self.regulators
            .get(alias)
            .map(|ctor| ctor(config))
            .ok_or_else(|| unknown(ExtensionKind::Regulator, alias))
    }

    /// Registered router aliases in sorted order.
    #[must_use]
    pub fn router_aliases(&self) -> Vec<&'static str> {
        sorted_keys(&self.routers)
    }

    /// Registered filter aliases in sorted order.
    #[must_use]
    pub fn filter_aliases(&self) -> Vec<&'static str> {
        sorted_keys(&self.filters)
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("routers", &sorted_keys(&self.routers))
            .field("filters", &sorted_keys(&self.filters))
            .field("load_balancers", &sorted_keys(&self.balancers))
            .field("regulators", &sorted_keys(&self.regulators))
            .finish()
    }
}

fn unknown(kind: ExtensionKind, alias: &str) -> ExtensionError {
    ExtensionError::UnknownAlias { kind, alias: alias.to_string() }
}

fn sorted_keys<V>(map: &HashMap<&'static str, V>) -> Vec<&'static str> {
    let mut keys: Vec<_> = map.keys().copied().collect();
    keys.sort_unstable();
    keys
}
