/// Graceful shutdown waits for outstanding work
use crate::support::*;
use game_rpcd::ServePolicy;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_shutdown_waits_for_every_handler() {
    let (logs, _guard) = capture_logs();

    let release = Arc::new(Semaphore::new(0));
    let permits = release.clone();
    let router = builtin_router(move |router| {
        router.register("Slow", move |_ctx| {
            let permits = permits.clone();
            async move {
                // Each release admits exactly one handler
                permits.acquire().await?.forget();
                Ok(json!({"done": true}))
            }
        });
    });
    let running = spawn_tcp(router.clone(), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    for id in 10..13 {
        client.request(id, "Slow", json!({})).await;
    }
    wait_until(|| router.in_flight_count() == 3).await;

    router.initiate_shutdown();
    router.initiate_shutdown();
    assert!(router.is_shutting_down());

    // Give the periodic logger a few ticks
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!router.shutdown_signal().is_cancelled());

    // Requests dispatched after shutdown began still get served
    client.request(20, "Ping", json!({})).await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(20));
    assert!(!router.shutdown_signal().is_cancelled());

    release.add_permits(1);
    let reply = client.recv().await;
    assert_eq!(reply["result"], json!({"done": true}));
    assert!(!router.shutdown_signal().is_cancelled());

    release.add_permits(2);
    for _ in 0..2 {
        let reply = client.recv().await;
        assert_eq!(reply["result"], json!({"done": true}));
    }

    tokio::time::timeout(Duration::from_secs(5), router.wait_for_shutdown())
        .await
        .expect("shutdown should complete once every handler returned");
    assert_eq!(router.in_flight_count(), 0);

    let output = logs.contents();
    assert_eq!(output.matches("Initiating graceful shutdown").count(), 1);
    assert_eq!(
        output
            .matches("No in-flight requests left, we can shut down now.")
            .count(),
        1
    );

    let logged: HashSet<&str> = output
        .lines()
        .filter_map(|line| line.split(" - ").nth(1))
        .filter(|item| item.contains("] Slow ("))
        .filter_map(|item| item.split(" (").next())
        .collect();
    assert_eq!(logged.len(), 3, "each outstanding handler is logged: {}", output);

    // The keep-alive loop stops accepting and waits for the client to leave
    drop(client);
    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("server should stop once its last connection closed")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_meta_shutdown_stops_keep_alive_server() {
    let router = builtin_router(|_| {});
    let running = spawn_tcp(router.clone(), ServePolicy::KeepAlive).await;

    let mut first = TestClient::connect(running.addr).await;
    first.authenticate(1).await;
    let mut second = TestClient::connect(running.addr).await;
    second.authenticate(1).await;

    second.request(2, "Meta.Shutdown", json!({})).await;
    assert_eq!(second.recv().await["result"], json!({}));

    tokio::time::timeout(Duration::from_secs(5), router.wait_for_shutdown())
        .await
        .expect("shutdown should complete");

    drop(first);
    drop(second);
    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("server should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_meta_flow_shuts_down_when_client_leaves() {
    let router = builtin_router(|_| {});
    let running = spawn_tcp(router.clone(), ServePolicy::CloseAfterFirst).await;

    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;
    client.request(2, "Meta.Flow", json!({})).await;

    let established = client.recv().await;
    assert_eq!(established["method"], json!("MetaFlowEstablished"));
    assert_eq!(established["params"]["pid"], json!(std::process::id()));
    assert!(!router.is_shutting_down());

    drop(client);

    tokio::time::timeout(Duration::from_secs(5), router.wait_for_shutdown())
        .await
        .expect("losing the flow connection shuts the daemon down");
    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("server should stop")
        .unwrap()
        .unwrap();
}
