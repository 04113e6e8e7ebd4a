//! Connection ownership through a referenced consumer.

use crate::support::{endpoint, key};
use std::{sync::Arc, time::Duration};
use switchyard_core::{
    address::DEFAULT_GROUP,
    config::{AppConfig, ConsumerConfig},
    connection::HealthReport,
    errors::RpcError,
    runtime::DispatchRuntime,
    transport::LoopbackTransport,
};

fn runtime_over(transport: &LoopbackTransport, health_checks: bool) -> DispatchRuntime {
    let builder = DispatchRuntime::builder()
        .with_config(AppConfig::default())
        .with_transport(Arc::new(transport.clone()));
    let builder =
        if health_checks { builder.enable_health_checks() } else { builder.disable_health_checks() };
    builder.build().expect("runtime builds")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_share_one_dial() {
    let transport = LoopbackTransport::new().with_dial_delay(Duration::from_millis(50));
    let runtime = runtime_over(&transport, false);
    let client = runtime.refer(ConsumerConfig::new("svc")).await.expect("referenced");
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;

    let calls: Vec<_> = (0..16)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.invoke(client.build_request("get", format!("{i}"))).await })
        })
        .collect();
    for call in calls {
        call.await.expect("task joins").expect("call succeeds");
    }

    assert_eq!(transport.dial_count(&key("a")), 1, "all callers awaited the same dial");
    assert_eq!(transport.send_count(&key("a")), 16);
    assert_eq!(client.connections().active_count(), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_dead_connection_evicted_and_redialed() {
    let transport = LoopbackTransport::new();
    let runtime = runtime_over(&transport, false);
    let client = runtime.refer(ConsumerConfig::new("svc")).await.expect("referenced");
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;

    client.invoke(client.build_request("get", "")).await.expect("first call");
    transport.sever(&key("a"));
    assert_eq!(client.connections().active_count(), 0);

    let report = client.connections().check_health().await;
    assert_eq!(report, HealthReport { checked: 1, evicted: 1 });

    client.invoke(client.build_request("get", "")).await.expect("redialed on demand");
    assert_eq!(transport.dial_count(&key("a")), 2);
    assert_eq!(client.connections().active_count(), 1);
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_background_checker_evicts_severed_connections() {
    let transport = LoopbackTransport::new();
    let runtime = runtime_over(&transport, true);
    let mut consumer = ConsumerConfig::new("svc");
    consumer.connection.health_check_interval_ms = 20;
    let client = runtime.refer(consumer).await.expect("referenced");
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100), endpoint("b", 100)]).await;

    for _ in 0..4 {
        client.invoke(client.build_request("get", "")).await.expect("call succeeds");
    }
    transport.sever(&key("a"));
    transport.sever(&key("b"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = client.connections().check_health().await;
    assert_eq!(report, HealthReport::default(), "checker already evicted every dead connection");

    client.invoke(client.build_request("get", "")).await.expect("redialed on demand");
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_eager_holder_dials_on_arrival_and_closes_on_removal() {
    let transport = LoopbackTransport::new();
    let runtime = runtime_over(&transport, false);
    let mut consumer = ConsumerConfig::new("svc");
    consumer.connection.lazy = false;
    let client = runtime.refer(consumer).await.expect("referenced");

    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100), endpoint("b", 100)]).await;
    assert_eq!(transport.dial_count(&key("a")), 1, "dialed before any call");
    assert_eq!(transport.dial_count(&key("b")), 1);
    assert_eq!(transport.open_connections(&key("a")), 1);

    client.remove_endpoints(DEFAULT_GROUP, &[key("a")]).await;
    assert_eq!(transport.open_connections(&key("a")), 0, "removed endpoint disconnected");
    assert_eq!(transport.open_connections(&key("b")), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_stale_selection_does_not_redial_removed_endpoint() {
    let transport = LoopbackTransport::new();
    let runtime = runtime_over(&transport, false);
    let client = runtime.refer(ConsumerConfig::new("svc")).await.expect("referenced");
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100), endpoint("b", 100)]).await;
    let selected = client
        .addresses()
        .all_endpoints()
        .into_iter()
        .find(|ep| ep.key() == &key("a"))
        .expect("a is known");

    client.remove_endpoints(DEFAULT_GROUP, &[key("a")]).await;
    let err = client.connections().get_connection(&selected).await.err().expect("a was removed");
    assert!(matches!(err, RpcError::Connection { .. }));
    assert_eq!(transport.dial_count(&key("a")), 0);
    assert_eq!(client.connections().active_count(), 0);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unrefer_closes_consumer_connections() {
    let transport = LoopbackTransport::new();
    let runtime = runtime_over(&transport, true);
    let client = runtime.refer(ConsumerConfig::new("svc")).await.expect("referenced");
    client.add_endpoints(DEFAULT_GROUP, vec![endpoint("a", 100)]).await;
    client.invoke(client.build_request("get", "")).await.expect("call succeeds");
    assert_eq!(transport.open_connections(&key("a")), 1);

    runtime.unrefer("svc").await.expect("known consumer");
    assert_eq!(transport.open_connections(&key("a")), 0);
    assert!(runtime.consumer("svc").is_none());
    assert!(runtime.stats().for_consumer("svc").is_empty(), "statistics dropped with the consumer");
    runtime.shutdown().await;
}
