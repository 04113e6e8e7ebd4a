//! Per-consumer address book.
//!
//! Groups are stored in a single immutable map behind an [`ArcSwap`]; every push builds a new
//! map and swaps it in, so readers never observe a half-applied update and never take a lock.
//! Each push returns an [`AddressDiff`] computed over the union of all groups and forwards it
//! to subscribed [`EndpointListener`]s. Pushes are serialized with their notifications, so
//! listeners see diffs in the order the swaps happened.

use crate::types::{EndpointInfo, EndpointKey};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
};
use tracing::debug;

pub const DEFAULT_GROUP: &str = "default";
pub const DIRECT_GROUP: &str = "direct";

/// Named, ordered set of endpoints. Endpoints are unique by key; first occurrence wins.
#[derive(Debug, Clone, Default)]
pub struct EndpointGroup {
    name: String,
    endpoints: Vec<Arc<EndpointInfo>>,
}

impl EndpointGroup {
    #[must_use]
    pub fn new(name: &str, endpoints: Vec<Arc<EndpointInfo>>) -> Self {
        let mut seen = HashSet::new();
        let endpoints =
            endpoints.into_iter().filter(|ep| seen.insert(ep.key().clone())).collect();
        Self { name: name.to_string(), endpoints }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Arc<EndpointInfo>] {
        &self.endpoints
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Endpoints added and removed relative to `previous`.
    #[must_use]
    pub fn diff(&self, previous: &EndpointGroup) -> AddressDiff {
        AddressDiff::between(&previous.endpoints, &self.endpoints)
    }
}

/// Endpoints that appeared or disappeared in an update.
#[derive(Debug, Clone, Default)]
pub struct AddressDiff {
    pub added: Vec<Arc<EndpointInfo>>,
    pub removed: Vec<EndpointKey>,
}

impl AddressDiff {
    fn between(before: &[Arc<EndpointInfo>], after: &[Arc<EndpointInfo>]) -> Self {
        let before_keys: HashSet<&EndpointKey> = before.iter().map(|ep| ep.key()).collect();
        let after_keys: HashSet<&EndpointKey> = after.iter().map(|ep| ep.key()).collect();
        let added =
            after.iter().filter(|ep| !before_keys.contains(ep.key())).cloned().collect();
        let removed = before
            .iter()
            .filter(|ep| !after_keys.contains(ep.key()))
            .map(|ep| ep.key().clone())
            .collect();
        Self { added, removed }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Receives address changes after they become visible to readers.
#[async_trait]
pub trait EndpointListener: Send + Sync {
    async fn on_added(&self, endpoints: &[Arc<EndpointInfo>]);
    async fn on_removed(&self, keys: &[EndpointKey]);
}

type GroupMap = BTreeMap<String, Arc<EndpointGroup>>;

/// Copy-on-write holder of every address group for one consumer.
pub struct AddressHolder {
    groups: ArcSwap<GroupMap>,
    listeners: RwLock<Vec<Arc<dyn EndpointListener>>>,
    push: tokio::sync::Mutex<()>,
}

impl Default for AddressHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressHolder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: ArcSwap::from_pointee(GroupMap::new()),
            listeners: RwLock::new(Vec::new()),
            push: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn EndpointListener>) {
        self.listeners.write().push(listener);
    }

    /// Current snapshot of one group. Missing groups yield an empty list.
    #[must_use]
    pub fn get_endpoints(&self, group: &str) -> Vec<Arc<EndpointInfo>> {
        self.groups.load().get(group).map(|g| g.endpoints.clone()).unwrap_or_default()
    }

    /// Current snapshot of every group.
    #[must_use]
    pub fn snapshot(&self) -> Arc<GroupMap> {
        self.groups.load_full()
    }

    /// Group names in sorted order.
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        self.groups.load().keys().cloned().collect()
    }

    /// Every endpoint across all groups, deduplicated by key, in group-name order.
    #[must_use]
    pub fn all_endpoints(&self) -> Vec<Arc<EndpointInfo>> {
        union_of(&self.groups.load())
    }

    /// Adds endpoints to `group`, creating it if needed.
    pub async fn add_endpoints(&self, group: &str, endpoints: Vec<EndpointInfo>) -> AddressDiff {
        self.apply(|current, canon| {
            let mut next = current.clone();
            let mut merged =
                current.get(group).map(|g| g.endpoints.clone()).unwrap_or_default();
            let present: HashSet<EndpointKey> =
                merged.iter().map(|ep| ep.key().clone()).collect();
            merged.extend(
                endpoints
                    .iter()
                    .filter(|ep| !present.contains(ep.key()))
                    .map(|ep| canon.resolve(ep)),
            );
            next.insert(group.to_string(), Arc::new(EndpointGroup::new(group, merged)));
            next
        })
        .await
    }

    /// Removes endpoints by key from `group`. Empty groups are dropped.
    pub async fn remove_endpoints(&self, group: &str, keys: &[EndpointKey]) -> AddressDiff {
        let doomed: HashSet<&EndpointKey> = keys.iter().collect();
        self.apply(|current, _| {
            let mut next = current.clone();
            if let Some(existing) = current.get(group) {
                let kept: Vec<_> = existing
                    .endpoints
                    .iter()
                    .filter(|ep| !doomed.contains(ep.key()))
                    .cloned()
                    .collect();
                if kept.is_empty() {
                    next.remove(group);
                } else {
                    next.insert(group.to_string(), Arc::new(EndpointGroup::new(group, kept)));
                }
            }
            next
        })
        .await
    }

    /// Replaces the content of `group` wholesale.
    pub async fn update_endpoints(&self, group: &str, endpoints: Vec<EndpointInfo>) -> AddressDiff {
        self.apply(|current, canon| {
            let mut next = current.clone();
            if endpoints.is_empty() {
                next.remove(group);
            } else {
                let resolved = endpoints.iter().map(|ep| canon.resolve(ep)).collect();
                next.insert(group.to_string(), Arc::new(EndpointGroup::new(group, resolved)));
            }
            next
        })
        .await
    }

    /// Replaces every group. Groups absent from `groups` are dropped.
    pub async fn replace_all(&self, groups: BTreeMap<String, Vec<EndpointInfo>>) -> AddressDiff {
        self.apply(|_, canon| {
            groups
                .iter()
                .filter(|(_, eps)| !eps.is_empty())
                .map(|(name, eps)| {
                    let resolved = eps.iter().map(|ep| canon.resolve(ep)).collect();
                    (name.clone(), Arc::new(EndpointGroup::new(name, resolved)))
                })
                .collect()
        })
        .await
    }

    async fn apply<F>(&self, mut build: F) -> AddressDiff
    where
        F: FnMut(&GroupMap, &Canonicalizer) -> GroupMap,
    {
        let _push = self.push.lock().await;
        let mut diff = AddressDiff::default();
        self.groups.rcu(|current| {
            let canon = Canonicalizer::new(current);
            let next = build(current, &canon);
            diff = AddressDiff::between(&union_of(current), &union_of(&next));
            Arc::new(next)
        });

        if !diff.is_empty() {
            debug!(added = diff.added.len(), removed = diff.removed.len(), "address groups updated");
            self.notify(&diff).await;
        }
        diff
    }

    async fn notify(&self, diff: &AddressDiff) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if !diff.removed.is_empty() {
                listener.on_removed(&diff.removed).await;
            }
            if !diff.added.is_empty() {
                listener.on_added(&diff.added).await;
            }
        }
    }
}

/// Maps incoming endpoints onto the instances already held so regulation state survives
/// registry pushes. A changed weight or metadata yields a new instance inheriting the state.
struct Canonicalizer {
    existing: BTreeMap<EndpointKey, Arc<EndpointInfo>>,
}

impl Canonicalizer {
    fn new(groups: &GroupMap) -> Self {
        let existing = union_of(groups).into_iter().map(|ep| (ep.key().clone(), ep)).collect();
        Self { existing }
    }

    fn resolve(&self, incoming: &EndpointInfo) -> Arc<EndpointInfo> {
        match self.existing.get(incoming.key()) {
            Some(current) if current.same_attributes(incoming) => Arc::clone(current),
            Some(current) => Arc::new(
                EndpointInfo::new(incoming.key().clone(), incoming.weight())
                    .with_metadata(incoming.metadata().clone())
                    .inherit_state(current),
            ),
            None => Arc::new(
                EndpointInfo::new(incoming.key().clone(), incoming.weight())
                    .with_metadata(incoming.metadata().clone()),
            ),
        }
    }
}

fn union_of(groups: &GroupMap) -> Vec<Arc<EndpointInfo>> {
    let mut seen = BTreeSet::new();
    groups
        .values()
        .flat_map(|g| g.endpoints.iter())
        .filter(|ep| seen.insert(ep.key().clone()))
        .cloned()
        .collect()
}
