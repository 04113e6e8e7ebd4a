//! Sync, future, callback and oneway calls end to end, including timeouts and retries.

use crate::support::{endpoint, key, round_robin_consumer, TestHarness};
use std::{sync::Arc, time::Duration};
use switchyard_core::{
    address::DEFAULT_GROUP,
    config::ConsumerConfig,
    errors::{FrameworkErrorKind, RpcError},
    invoker::{CallContext, ResponseCallback},
    runtime::ConsumerClient,
    transport::{LoopbackBehavior, LoopbackTransport},
    types::{EndpointKey, RpcRequest, RpcResponse},
};
use tokio::sync::mpsc;

/// Forwards every callback invocation as `(method, kind)` on a channel.
struct ChannelCallback {
    tx: mpsc::UnboundedSender<(String, &'static str)>,
}

impl ResponseCallback for ChannelCallback {
    fn on_app_response(&self, _response: RpcResponse, request: &RpcRequest) {
        let _ = self.tx.send((request.method.clone(), "response"));
    }

    fn on_app_exception(&self, _error: RpcError, request: &RpcRequest) {
        let _ = self.tx.send((request.method.clone(), "app_exception"));
    }

    fn on_framework_exception(&self, _error: RpcError, request: &RpcRequest) {
        let _ = self.tx.send((request.method.clone(), "framework_exception"));
    }
}

async fn single_endpoint(harness: &TestHarness, consumer: ConsumerConfig) -> Arc<ConsumerClient> {
    let client = harness.refer(consumer).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;
    client
}

async fn wait_for_sends(transport: &LoopbackTransport, key: &EndpointKey, expected: u64) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while transport.send_count(key) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sends observed in time");
}

#[tokio::test]
async fn test_future_mode_and_context_clearing() {
    let harness = TestHarness::new(None);
    let client = single_endpoint(&harness, ConsumerConfig::new("svc")).await;
    let context = CallContext::new();

    assert!(matches!(context.future(), Err(RpcError::NoPendingFuture)));

    let returned = client
        .invoke_future(client.build_request("get", "one"), &context)
        .await
        .expect("dispatched");
    let stored = context.future().expect("future stored in context");

    let response = context.get_response(Duration::from_secs(1), false).await.expect("resolved");
    assert_eq!(response.payload.as_ref(), b"one");
    assert!(returned.is_done() && stored.is_done(), "every handle sees the outcome");

    let again = context.get_response(Duration::from_secs(1), true).await.expect("still stored");
    assert_eq!(again.payload.as_ref(), b"one");
    assert!(
        matches!(context.get_response(Duration::from_secs(1), true).await, Err(RpcError::NoPendingFuture)),
        "cleared after the first clearing read"
    );
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_future_mode_reports_route_failure_immediately() {
    let harness = TestHarness::new(None);
    let client = harness.refer(ConsumerConfig::new("svc")).await;
    let context = CallContext::new();

    let err = client
        .invoke_future(client.build_request("get", ""), &context)
        .await
        .expect_err("no endpoints");
    assert!(matches!(err, RpcError::Route { .. }));
    assert!(context.future().is_err(), "nothing stored for a call that never dispatched");
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_callback_routing_by_outcome() {
    let harness = TestHarness::new(None);
    let client = single_endpoint(&harness, ConsumerConfig::new("svc")).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: Arc<dyn ResponseCallback> = Arc::new(ChannelCallback { tx });

    client.invoke_callback(client.build_request("ok", ""), Arc::clone(&callback)).await.expect("sent");
    assert_eq!(rx.recv().await, Some(("ok".to_string(), "response")));

    harness.transport.set_behavior(
        &key("a"),
        LoopbackBehavior::Fail(RpcError::Remote { code: 404, message: "no such order".into() }),
    );
    client.invoke_callback(client.build_request("missing", ""), Arc::clone(&callback)).await.expect("sent");
    assert_eq!(rx.recv().await, Some(("missing".to_string(), "app_exception")));

    harness.transport.set_behavior(
        &key("a"),
        LoopbackBehavior::Fail(RpcError::framework(FrameworkErrorKind::Codec, "bad payload")),
    );
    client.invoke_callback(client.build_request("garbled", ""), Arc::clone(&callback)).await.expect("sent");
    assert_eq!(rx.recv().await, Some(("garbled".to_string(), "framework_exception")));

    let stat = harness.runtime.stats().get("svc", &key("a")).expect("stat exists");
    assert_eq!(stat.current().invocations, 3);
    assert_eq!(stat.current().exceptions, 1, "remote errors are not failures by default");
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_oneway_calls_are_recorded() {
    let harness = TestHarness::new(None);
    let client = single_endpoint(&harness, ConsumerConfig::new("svc")).await;

    for i in 0..3 {
        client.invoke_oneway(client.build_request("notify", format!("{i}"))).await.expect("sent");
    }
    wait_for_sends(&harness.transport, &key("a"), 3).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let recorded = harness
                .runtime
                .stats()
                .get("svc", &key("a"))
                .map_or(0, |s| s.current().invocations);
            if recorded == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("oneway outcomes recorded");
    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_once_and_late_response_is_recorded() {
    let harness = TestHarness::new(None);
    let mut consumer = ConsumerConfig::new("svc");
    consumer.timeout_ms = 100;
    consumer.late_response_grace_ms = 1_000;
    let client = single_endpoint(&harness, consumer).await;
    harness.transport.set_behavior(
        &key("a"),
        LoopbackBehavior::Delay(Duration::from_millis(500), Box::new(LoopbackBehavior::Echo)),
    );

    let err = client.invoke(client.build_request("slow", "")).await.expect_err("times out");
    assert_eq!(err, RpcError::Timeout(Duration::from_millis(100)));

    let stat = harness.runtime.stats().get("svc", &key("a")).expect("stat exists");
    assert_eq!(stat.current().invocations, 1);
    assert_eq!(stat.current().exceptions, 1, "timeout recorded when it fires");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(stat.current().invocations, 2, "late response recorded as its own sample");
    assert_eq!(stat.current().exceptions, 1, "late success adds no failure");
    assert_eq!(stat.late_responses(), 1);
    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_response_past_grace_is_never_recorded() {
    let harness = TestHarness::new(None);
    let mut consumer = ConsumerConfig::new("svc");
    consumer.timeout_ms = 100;
    consumer.late_response_grace_ms = 200;
    let client = single_endpoint(&harness, consumer).await;
    harness.transport.set_behavior(
        &key("a"),
        LoopbackBehavior::Delay(Duration::from_secs(5), Box::new(LoopbackBehavior::Echo)),
    );

    client.invoke(client.build_request("stuck", "")).await.expect_err("times out");
    tokio::time::sleep(Duration::from_secs(10)).await;

    let stat = harness.runtime.stats().get("svc", &key("a")).expect("stat exists");
    assert_eq!(stat.current().invocations, 1, "only the timeout counts");
    assert_eq!(stat.late_responses(), 0, "send aborted after the grace period");
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_retry_fails_over_refused_endpoint() {
    let harness = TestHarness::new(None);
    let mut consumer = round_robin_consumer("svc");
    consumer.retries = 1;
    let client = harness.refer(consumer).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("down", 1), endpoint("up", 1)]).await;
    harness.transport.set_behavior(&key("down"), LoopbackBehavior::Refuse);

    for _ in 0..10 {
        client.invoke(client.build_request("get", "")).await.expect("retry lands on the live endpoint");
    }
    assert_eq!(harness.transport.send_count(&key("up")), 10);
    assert_eq!(harness.transport.send_count(&key("down")), 0);

    let down = harness.runtime.stats().get("svc", &key("down")).expect("failed dials recorded");
    assert_eq!(down.current().invocations, down.current().exceptions);
    assert!(down.current().exceptions >= 1);
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_bounds_attempts() {
    let harness = TestHarness::new(None);
    let mut consumer = round_robin_consumer("svc");
    consumer.retries = 1;
    let client = harness.refer(consumer).await;
    client
        .add_endpoints(DEFAULT_GROUP, vec![endpoint("b1", 1), endpoint("b2", 1), endpoint("b3", 1)])
        .await;
    for host in ["b1", "b2", "b3"] {
        harness.transport.set_behavior(&key(host), LoopbackBehavior::Refuse);
    }

    let err = client.invoke(client.build_request("get", "")).await.expect_err("all refused");
    assert!(matches!(err, RpcError::Connection { .. }), "unexpected {err:?}");
    let dials: u64 = ["b1", "b2", "b3"].iter().map(|h| harness.transport.dial_count(&key(h))).sum();
    assert_eq!(dials, 2, "one attempt plus one retry");
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_all_endpoints_refused_reports_connection_error() {
    let harness = TestHarness::new(None);
    let mut consumer = round_robin_consumer("svc");
    consumer.retries = 3;
    let client = harness.refer(consumer).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("r1", 1), endpoint("r2", 1)]).await;
    harness.transport.set_behavior(&key("r1"), LoopbackBehavior::Refuse);
    harness.transport.set_behavior(&key("r2"), LoopbackBehavior::Refuse);

    let err = client.invoke(client.build_request("get", "")).await.expect_err("all refused");
    assert!(
        matches!(err, RpcError::Connection { .. }),
        "transport failure surfaces once candidates run out, got {err:?}"
    );
    assert_eq!(harness.transport.dial_count(&key("r1")), 1);
    assert_eq!(harness.transport.dial_count(&key("r2")), 1);
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_calls_rejected_after_shutdown() {
    let harness = TestHarness::new(None);
    let client = single_endpoint(&harness, ConsumerConfig::new("svc")).await;
    harness.runtime.shutdown().await;

    let err = client.invoke(client.build_request("get", "")).await.expect_err("shut down");
    assert_eq!(err, RpcError::ShuttingDown);
    let err = client.invoke_oneway(client.build_request("get", "")).await.expect_err("shut down");
    assert_eq!(err, RpcError::ShuttingDown);
}
