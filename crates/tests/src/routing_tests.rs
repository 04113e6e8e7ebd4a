//! Candidate resolution through the router chain and connection holders.

use crate::support::{endpoint, key, CallJournal, JournalFilter, TestHarness};
use std::{collections::BTreeMap, sync::Arc};
use switchyard_core::{
    address::{AddressHolder, DEFAULT_GROUP},
    config::{ConsumerConfig, HolderKind},
    errors::RpcError,
    extension::ExtensionRegistry,
    router::{RouteDecision, Router},
    transport::SERVED_BY_HEADER,
    types::{EndpointInfo, RpcRequest},
};

fn journaled_extensions(journal: &Arc<CallJournal>) -> ExtensionRegistry {
    let mut extensions = ExtensionRegistry::with_defaults();
    let journal = Arc::clone(journal);
    extensions.register_filter("journal", move || {
        Arc::new(JournalFilter {
            alias: "journal",
            order: 100,
            watch_header: "x-none",
            journal: Arc::clone(&journal),
        })
    });
    extensions
}

fn route_entries(journal: &CallJournal) -> Vec<String> {
    journal.entries().into_iter().filter(|e| e.starts_with("journal:route:")).collect()
}

#[tokio::test]
async fn test_direct_url_short_circuits_registry_endpoints() {
    let journal = CallJournal::new();
    let harness = TestHarness::with_extensions(None, journaled_extensions(&journal));
    let mut consumer = ConsumerConfig::new("svc");
    consumer.direct_url = Some("tcp://direct:1".to_string());
    let client = harness.refer(consumer).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("registry-host", 100)]).await;

    for _ in 0..5 {
        let response = client.invoke(client.build_request("get", "")).await.expect("call succeeds");
        assert_eq!(response.header(SERVED_BY_HEADER), Some("tcp://direct:1"));
    }

    assert_eq!(route_entries(&journal), vec!["journal:route:direct"; 5]);
    assert_eq!(harness.transport.dial_count(&key("registry-host")), 0, "registry endpoint untouched");
    assert_eq!(harness.transport.send_count(&key("direct")), 5);
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_registry_endpoints_used_without_direct_url() {
    let journal = CallJournal::new();
    let harness = TestHarness::with_extensions(None, journaled_extensions(&journal));
    let client = harness.refer(ConsumerConfig::new("svc")).await;

    let err = client.invoke(client.build_request("get", "")).await.expect_err("nothing to route to");
    assert!(matches!(err, RpcError::Route { .. }), "expected route error, got {err:?}");

    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;
    client.invoke(client.build_request("get", "")).await.expect("call succeeds");
    assert_eq!(route_entries(&journal).last().map(String::as_str), Some("journal:route:registry"));
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_merge_groups_fallback_when_default_group_empty() {
    let harness = TestHarness::new(None);
    let plain = harness.refer(ConsumerConfig::new("plain")).await;
    let mut merging = ConsumerConfig::new("merging");
    merging.merge_groups_on_empty = true;
    let merging = harness.refer(merging).await;

    for client in [&plain, &merging] {
        client.add_endpoints("zone-a", vec![endpoint("a", 100)]).await;
        client.add_endpoints("zone-b", vec![endpoint("b", 100)]).await;
    }

    let err = plain.invoke(plain.build_request("get", "")).await.expect_err("default group empty");
    assert!(matches!(err, RpcError::Route { .. }));

    let mut served = std::collections::BTreeSet::new();
    for _ in 0..50 {
        let response = merging.invoke(merging.build_request("get", "")).await.expect("merged");
        served.insert(response.header(SERVED_BY_HEADER).map(str::to_string));
    }
    assert!(served.len() > 1, "random balancer spreads over both groups: {served:?}");
    harness.runtime.shutdown().await;
}

/// Keeps only endpoints tagged with the request's `x-zone` header, if one is set.
struct ZoneRouter;

impl Router for ZoneRouter {
    fn alias(&self) -> &'static str {
        "zone"
    }

    fn order(&self) -> i32 {
        -10_000
    }

    fn need_to_load(
        &self,
        consumer: &ConsumerConfig,
    ) -> Result<bool, switchyard_core::extension::ExtensionError> {
        Ok(consumer.direct_url.is_none())
    }

    fn route(
        &self,
        request: &mut RpcRequest,
        _addresses: &AddressHolder,
        candidates: Vec<Arc<EndpointInfo>>,
    ) -> RouteDecision {
        let Some(zone) = request.header("x-zone").map(str::to_string) else {
            return RouteDecision::Continue(candidates);
        };
        request.route_record.push("zone");
        RouteDecision::Continue(
            candidates
                .into_iter()
                .filter(|ep| ep.metadata().get("zone") == Some(&zone))
                .collect(),
        )
    }
}

#[tokio::test]
async fn test_custom_router_runs_after_builtin_routers() {
    let mut extensions = ExtensionRegistry::with_defaults();
    extensions.register_router("zone", || Arc::new(ZoneRouter));
    let harness = TestHarness::with_extensions(None, extensions);
    let client = harness.refer(ConsumerConfig::new("svc")).await;

    let tagged = |host: &str, zone: &str| {
        endpoint(host, 100).with_metadata(BTreeMap::from([("zone".to_string(), zone.to_string())]))
    };
    client.add_endpoints(DEFAULT_GROUP, vec![tagged("east-1", "east"), tagged("west-1", "west")]).await;

    for _ in 0..10 {
        let request = client.build_request("get", "").with_header("x-zone", "west");
        let response = client.invoke(request).await.expect("west endpoint available");
        assert_eq!(response.header(SERVED_BY_HEADER), Some("tcp://west-1:1"));
    }
    assert_eq!(harness.transport.send_count(&key("east-1")), 0);

    let request = client.build_request("get", "").with_header("x-zone", "north");
    let err = client.invoke(request).await.expect_err("no endpoint in zone");
    assert!(matches!(err, RpcError::Route { .. }));
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_elastic_holder_limits_traffic_to_held_subset() {
    let harness = TestHarness::new(None);
    let mut consumer = ConsumerConfig::new("svc");
    consumer.connection.holder = HolderKind::Elastic;
    consumer.connection.elastic_percent = 25;
    consumer.connection.elastic_min_count = 1;
    let client = harness.refer(consumer).await;

    let hosts: Vec<String> = (0..8).map(|i| format!("node-{i}")).collect();
    client
        .add_endpoints(DEFAULT_GROUP, hosts.iter().map(|h| endpoint(h, 100)).collect())
        .await;

    for _ in 0..40 {
        client.invoke(client.build_request("get", "")).await.expect("call succeeds");
    }
    let used: Vec<&String> =
        hosts.iter().filter(|h| harness.transport.send_count(&key(h)) > 0).collect();
    assert_eq!(used.len(), 2, "25% of 8 endpoints are held: {used:?}");
    assert!(client.connections().active_count() <= 2);

    let dropped = used[0].clone();
    client.remove_endpoints(DEFAULT_GROUP, &[key(&dropped)]).await;
    let before: u64 = hosts.iter().map(|h| harness.transport.send_count(&key(h))).sum();
    for _ in 0..40 {
        client.invoke(client.build_request("get", "")).await.expect("call succeeds");
    }
    let after: u64 = hosts.iter().map(|h| harness.transport.send_count(&key(h))).sum();
    assert_eq!(after - before, 40);

    let now_used = hosts
        .iter()
        .filter(|h| **h != dropped && harness.transport.send_count(&key(h)) > 0)
        .count();
    assert_eq!(now_used, 2, "a replacement joined the subset");
    harness.runtime.shutdown().await;
}
