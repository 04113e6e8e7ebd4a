//! Filter ordering, request mutation and short-circuits around real calls.

use crate::support::{endpoint, key, CallJournal, HeaderStamp, JournalFilter, RejectingFilter, TestHarness};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use switchyard_core::{
    address::DEFAULT_GROUP,
    config::ConsumerConfig,
    errors::RpcError,
    extension::ExtensionRegistry,
    filter::{Filter, Next, REQUEST_ID_HEADER},
    invoker::CallContext,
    runtime::RuntimeError,
    types::{RpcRequest, RpcResponse},
};

fn registry_with(journal: &Arc<CallJournal>) -> ExtensionRegistry {
    let mut extensions = ExtensionRegistry::with_defaults();
    let j = Arc::clone(journal);
    extensions.register_filter("stamp", move || {
        Arc::new(HeaderStamp {
            alias: "stamp",
            order: -100,
            name: "x-tenant",
            value: "acme",
            journal: Arc::clone(&j),
        })
    });
    let j = Arc::clone(journal);
    extensions.register_filter("journal", move || {
        Arc::new(JournalFilter {
            alias: "journal",
            order: 100,
            watch_header: "x-tenant",
            journal: Arc::clone(&j),
        })
    });
    let j = Arc::clone(journal);
    extensions.register_filter("reject", move || {
        Arc::new(RejectingFilter { alias: "reject", order: -100, journal: Arc::clone(&j) })
    });
    extensions
}

fn consumer_with(filters: &[&str]) -> ConsumerConfig {
    let mut consumer = ConsumerConfig::new("svc");
    consumer.filters = filters.iter().map(|f| (*f).to_string()).collect();
    consumer
}

#[tokio::test]
async fn test_outer_filter_mutation_visible_to_inner_filter() {
    let journal = CallJournal::new();
    let harness = TestHarness::with_extensions(None, registry_with(&journal));
    let client = harness.refer(consumer_with(&["journal", "stamp"])).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;

    let response = client.invoke(client.build_request("get", "")).await.expect("call succeeds");
    assert_eq!(response.header("x-tenant"), Some("acme"), "header reached the endpoint");
    assert_eq!(
        journal.entries(),
        vec![
            "stamp:in",
            "journal:in:x-tenant=acme",
            "journal:route:registry",
            "journal:out",
            "stamp:out",
        ],
        "lower order wraps higher order regardless of configured sequence"
    );
    assert_eq!(client.proxy().chain().aliases(), vec!["stamp", "journal"]);
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_rejecting_filter_stops_inner_layers() {
    let journal = CallJournal::new();
    let harness = TestHarness::with_extensions(None, registry_with(&journal));
    let client = harness.refer(consumer_with(&["reject", "journal"])).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;

    let err = client.invoke(client.build_request("delete", "")).await.expect_err("rejected");
    assert!(
        matches!(&err, RpcError::FilterRejected { filter, .. } if filter == "reject"),
        "unexpected error {err:?}"
    );
    assert_eq!(journal.entries(), vec!["reject:reject"], "inner filter never ran");
    assert_eq!(harness.transport.send_count(&key("a")), 0);
    assert_eq!(harness.transport.dial_count(&key("a")), 0);
    assert!(
        harness.runtime.stats().get("svc", &key("a")).is_none(),
        "rejected calls never touch endpoint statistics"
    );
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_default_chain_loads_every_registered_filter() {
    let harness = TestHarness::new(None);
    let client = harness.refer(ConsumerConfig::new("svc")).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;

    assert_eq!(client.proxy().chain().aliases(), vec!["request_id", "access_log"]);
    let response = client.invoke(client.build_request("get", "")).await.expect("call succeeds");
    assert!(response.header(REQUEST_ID_HEADER).is_some(), "request id stamped and echoed");

    let preset = client.build_request("get", "").with_header(REQUEST_ID_HEADER, "fixed");
    let response = client.invoke(preset).await.expect("call succeeds");
    assert_eq!(response.header(REQUEST_ID_HEADER), Some("fixed"), "caller id kept");
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_filter_alias_rejects_consumer() {
    let harness = TestHarness::new(None);
    let result = harness.runtime.refer(consumer_with(&["does_not_exist"])).await;
    assert!(matches!(result, Err(RuntimeError::Extension(_))), "unexpected {:?}", result.err());
    assert!(harness.runtime.consumer("svc").is_none());
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_async_observer_sees_future_completion() {
    let journal = CallJournal::new();
    let harness = TestHarness::with_extensions(None, registry_with(&journal));
    let client = harness.refer(consumer_with(&["journal"])).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;

    let context = CallContext::new();
    let future = client
        .invoke_future(client.build_request("lookup", "k"), &context)
        .await
        .expect("dispatched");
    let response = future.get(Duration::from_secs(1)).await.expect("resolved");
    assert_eq!(response.payload.as_ref(), b"k");

    let entries = journal.entries();
    assert_eq!(entries.last().map(String::as_str), Some("journal:async:lookup:ok"));
    assert_eq!(entries.iter().filter(|e| e.contains(":async:")).count(), 1, "observed once");
    harness.runtime.shutdown().await;
}

/// Answers `cached` calls without going further down the chain.
struct CacheFilter;

#[async_trait]
impl Filter for CacheFilter {
    fn alias(&self) -> &'static str {
        "cache"
    }

    fn order(&self) -> i32 {
        0
    }

    async fn invoke(&self, request: &mut RpcRequest, next: Next<'_>) -> Result<RpcResponse, RpcError> {
        if request.method == "cached" {
            return Ok(RpcResponse::new("from-cache"));
        }
        next.invoke(request).await
    }
}

#[tokio::test]
async fn test_filter_answer_resolves_future_without_send() {
    let mut extensions = ExtensionRegistry::with_defaults();
    extensions.register_filter("cache", || Arc::new(CacheFilter));
    let harness = TestHarness::with_extensions(None, extensions);
    let client = harness.refer(consumer_with(&["cache"])).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;

    let context = CallContext::new();
    client.invoke_future(client.build_request("cached", ""), &context).await.expect("answered");
    let response =
        context.get_response(Duration::from_secs(1), true).await.expect("resolved by the filter");
    assert_eq!(response.payload.as_ref(), b"from-cache");
    assert_eq!(harness.transport.send_count(&key("a")), 0);
    harness.runtime.shutdown().await;
}
