//! End-to-end regulation behavior.
//!
//! Each test references a consumer on a loopback transport, scripts endpoint failures, and
//! drives the regulation loop with manual ticks. Time-dependent tests run on a paused clock.

use crate::support::{endpoint, key, manual_regulation, round_robin_consumer, TestHarness};
use std::time::Duration;
use switchyard_core::{
    address::DEFAULT_GROUP,
    balancer::WeightedCandidate,
    errors::{FrameworkErrorKind, RpcError},
    runtime::ConsumerClient,
    transport::LoopbackBehavior,
    types::{EndpointInfo, RegulationState},
};

fn broken() -> LoopbackBehavior {
    LoopbackBehavior::Fail(RpcError::framework(FrameworkErrorKind::Protocol, "corrupt frame"))
}

async fn call_n(client: &ConsumerClient, n: usize) -> (usize, usize) {
    let mut ok = 0;
    let mut failed = 0;
    for _ in 0..n {
        match client.invoke(client.build_request("work", "")).await {
            Ok(_) => ok += 1,
            Err(_) => failed += 1,
        }
    }
    (ok, failed)
}

fn find(client: &ConsumerClient, host: &str) -> std::sync::Arc<EndpointInfo> {
    client
        .addresses()
        .all_endpoints()
        .into_iter()
        .find(|ep| ep.key() == &key(host))
        .expect("endpoint present")
}

#[tokio::test]
async fn test_failing_endpoint_regulated_and_traffic_moves_away() {
    let harness =
        TestHarness::new(Some(manual_regulation(Duration::from_secs(30), Duration::from_secs(10))));
    let client = harness.refer(round_robin_consumer("svc")).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("x", 10), endpoint("y", 10)]).await;
    harness.transport.set_behavior(&key("x"), broken());

    let (ok, failed) = call_n(&client, 40).await;
    assert_eq!((ok, failed), (20, 20), "round robin splits evenly; every call to x fails");

    let regulation = harness.runtime.regulation().expect("regulation configured");
    let summary = regulation.tick().await;
    assert_eq!(summary.regulated, 1);
    assert_eq!(find(&client, "x").regulation_state(), RegulationState::Regulated);
    assert_eq!(find(&client, "y").regulation_state(), RegulationState::Normal);
    assert_eq!(harness.transport.open_connections(&key("x")), 0, "connection released");

    let sends_to_x = harness.transport.send_count(&key("x"));
    let (ok, failed) = call_n(&client, 20).await;
    assert_eq!((ok, failed), (20, 0), "all traffic lands on y");
    assert_eq!(harness.transport.send_count(&key("x")), sends_to_x, "x never selected");
    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovered_endpoint_returns_to_full_weight() {
    let harness =
        TestHarness::new(Some(manual_regulation(Duration::from_secs(10), Duration::from_secs(5))));
    let regulation = harness.runtime.regulation().expect("regulation configured");
    let probe_share = regulation.config().probe_share;
    let client = harness.refer(round_robin_consumer("svc")).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("x", 10), endpoint("y", 10)]).await;

    harness.transport.set_behavior(&key("x"), broken());
    call_n(&client, 40).await;
    regulation.tick().await;
    let x = find(&client, "x");
    assert_eq!(x.regulation_state(), RegulationState::Regulated);

    harness.transport.reset_behavior(&key("x"));
    tokio::time::advance(Duration::from_secs(5)).await;
    regulation.tick().await;
    assert_eq!(x.regulation_state(), RegulationState::Regulated, "degrade not yet elapsed");

    tokio::time::advance(Duration::from_secs(6)).await;
    let summary = regulation.tick().await;
    assert_eq!(summary.recovering, 1);
    assert_eq!(x.regulation_state(), RegulationState::Recovering);
    let probing = WeightedCandidate::from_endpoint(x.clone(), probe_share).expect("selectable");
    assert_eq!(probing.effective_weight, 5, "recovering endpoints get a reduced share");

    let sends_before = harness.transport.send_count(&key("x"));
    let (_, failed) = call_n(&client, 30).await;
    assert_eq!(failed, 0);
    assert!(harness.transport.send_count(&key("x")) - sends_before >= 5, "x receives probe calls");

    regulation.tick().await;
    assert_eq!(x.regulation_state(), RegulationState::Recovering, "recovery window not elapsed");

    tokio::time::advance(Duration::from_secs(6)).await;
    let summary = regulation.tick().await;
    assert_eq!(summary.restored, 1);
    assert_eq!(x.regulation_state(), RegulationState::Normal);
    let restored = WeightedCandidate::from_endpoint(x.clone(), probe_share).expect("selectable");
    assert_eq!(restored.effective_weight, 10, "full static weight again");
    assert!(regulation.entry("svc", x.key()).is_none(), "bookkeeping dropped");
    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_escalates_degrade() {
    let harness =
        TestHarness::new(Some(manual_regulation(Duration::from_secs(10), Duration::from_secs(5))));
    let regulation = harness.runtime.regulation().expect("regulation configured");
    let client = harness.refer(round_robin_consumer("svc")).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("x", 10), endpoint("y", 10)]).await;
    harness.transport.set_behavior(&key("x"), broken());

    call_n(&client, 40).await;
    regulation.tick().await;
    tokio::time::advance(Duration::from_secs(11)).await;
    regulation.tick().await;
    let x = find(&client, "x");
    assert_eq!(x.regulation_state(), RegulationState::Recovering);

    call_n(&client, 30).await;
    let summary = regulation.tick().await;
    assert_eq!(summary.escalated, 1, "probe calls still fail");
    assert_eq!(x.regulation_state(), RegulationState::Regulated);
    let entry = regulation.entry("svc", x.key()).expect("bookkeeping kept");
    assert_eq!(entry.strikes, 1);
    assert_eq!(entry.current_degrade, Duration::from_secs(20));

    tokio::time::advance(Duration::from_secs(11)).await;
    regulation.tick().await;
    assert_eq!(x.regulation_state(), RegulationState::Regulated, "escalated degrade is longer");
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_last_selectable_endpoint_is_never_regulated() {
    let harness =
        TestHarness::new(Some(manual_regulation(Duration::from_secs(30), Duration::from_secs(10))));
    let regulation = harness.runtime.regulation().expect("regulation configured");
    let client = harness.refer(round_robin_consumer("svc")).await;
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("only", 10)]).await;
    harness.transport.set_behavior(&key("only"), broken());

    call_n(&client, 20).await;
    let summary = regulation.tick().await;
    assert_eq!(summary.regulated, 0);
    assert_eq!(summary.blocked, 1);
    assert_eq!(find(&client, "only").regulation_state(), RegulationState::Normal);
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn test_regulation_is_scoped_per_consumer() {
    let harness =
        TestHarness::new(Some(manual_regulation(Duration::from_secs(30), Duration::from_secs(10))));
    let regulation = harness.runtime.regulation().expect("regulation configured");
    let orders = harness.refer(round_robin_consumer("orders")).await;
    let billing = harness.refer(round_robin_consumer("billing")).await;
    for client in [&orders, &billing] {
        client.add_endpoints(DEFAULT_GROUP, vec![endpoint("x", 10), endpoint("y", 10)]).await;
    }
    harness.transport.set_behavior(&key("x"), broken());

    call_n(&orders, 40).await;
    regulation.tick().await;

    assert_eq!(find(&orders, "x").regulation_state(), RegulationState::Regulated);
    assert_eq!(
        find(&billing, "x").regulation_state(),
        RegulationState::Normal,
        "billing never saw x fail"
    );
    harness.runtime.shutdown().await;
}
