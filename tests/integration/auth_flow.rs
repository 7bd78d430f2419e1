/// Authentication gate and built-in methods over TCP
use crate::support::*;
use game_rpcd::ServePolicy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn test_ping_is_withheld_until_authenticated() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;

    client.request(1, "Ping", json!({})).await;
    assert!(
        client.recv_within(Duration::from_millis(200)).await.is_none(),
        "no reply may arrive before authentication"
    );

    client
        .request(2, "Meta.Authenticate", json!({"secret": secret()}))
        .await;

    let mut replies: HashMap<i64, Value> = HashMap::new();
    for _ in 0..2 {
        let reply = client.recv().await;
        replies.insert(reply["id"].as_i64().unwrap(), reply);
    }
    assert_eq!(replies[&1]["result"], json!({}));
    assert_eq!(replies[&2]["result"], json!({"ok": true}));

    running.server.token().cancel();
}

#[tokio::test]
async fn test_wrong_secret_is_an_error_and_keeps_gate_closed() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;

    client
        .request(1, "Meta.Authenticate", json!({"secret": "nope"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(1));
    assert!(reply["error"].is_object());

    client.request(2, "Ping", json!({})).await;
    assert!(client.recv_within(Duration::from_millis(200)).await.is_none());

    running.server.token().cancel();
}

#[tokio::test]
async fn test_cancel_unknown_id() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    client.request(2, "Cancel", json!({"id": "unknown"})).await;
    let reply = client.recv().await;
    assert_eq!(reply["result"], json!({"didCancel": false}));

    running.server.token().cancel();
}

#[tokio::test]
async fn test_cancel_registered_operation() {
    let router = builtin_router(|router| {
        router.register("Download", |ctx| async move {
            let token = ctx.token().child_token();
            ctx.cancel_funcs().add("download-1", token.clone());
            token.cancelled().await;
            ctx.cancel_funcs().remove("download-1");
            Ok(json!({"cancelled": true}))
        });
    });
    let running = spawn_tcp(router.clone(), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    client.request(2, "Download", json!({})).await;
    while router.cancel_funcs().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.request(3, "Cancel", json!({"id": "download-1"})).await;
    let mut replies: HashMap<i64, Value> = HashMap::new();
    for _ in 0..2 {
        let reply = client.recv().await;
        replies.insert(reply["id"].as_i64().unwrap(), reply);
    }
    assert_eq!(replies[&3]["result"], json!({"didCancel": true}));
    assert_eq!(replies[&2]["result"], json!({"cancelled": true}));

    running.server.token().cancel();
}

#[tokio::test]
async fn test_version_and_unknown_method() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    client.request(2, "Version.Get", json!({})).await;
    let reply = client.recv().await;
    let version = reply["result"]["version"].as_str().unwrap();
    assert!(version.starts_with('v'));
    assert!(reply["result"]["versionString"].is_string());

    client.request(3, "Does.Not.Exist", json!({})).await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(-32601));

    running.server.token().cancel();
}

#[tokio::test]
async fn test_simulated_offline_is_network_error() {
    let router = builtin_router(|router| {
        router.register("Fetch", |ctx| async move {
            ctx.ensure_online()?;
            Ok(json!({"fetched": true}))
        });
    });
    let running = spawn_tcp(router, ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    client.request(2, "Fetch", json!({})).await;
    assert_eq!(client.recv().await["result"], json!({"fetched": true}));

    client
        .request(3, "Network.SetSimulateOffline", json!({"enabled": true}))
        .await;
    assert_eq!(client.recv().await["result"], json!({}));

    client.request(4, "Fetch", json!({})).await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(9000));

    running.server.token().cancel();
}

#[tokio::test]
async fn test_double_twice_calls_back_into_client() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    client
        .request(2, "Test.DoubleTwice", json!({"number": 3}))
        .await;

    // The daemon asks us to double first
    let call = client.recv().await;
    assert_eq!(call["method"], json!("Test.Double"));
    let number = call["params"]["number"].as_i64().unwrap();
    assert_eq!(number, 3);
    client
        .send(json!({"jsonrpc": "2.0", "id": call["id"], "result": {"number": number * 2}}))
        .await;

    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(2));
    assert_eq!(reply["result"], json!({"number": 12}));

    running.server.token().cancel();
}

#[tokio::test]
async fn test_progress_and_log_notifications_reach_client() {
    let router = builtin_router(|router| {
        router.register("Install", |ctx| async move {
            ctx.info("installing").await;
            ctx.start_progress();
            ctx.progress(0.5).await?;
            ctx.end_progress();
            Ok(json!({}))
        });
    });
    let running = spawn_tcp(router, ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    client.request(2, "Install", json!({})).await;

    let log = client.recv().await;
    assert_eq!(log["method"], json!("Log"));
    assert_eq!(log["params"], json!({"level": "info", "message": "installing"}));
    assert!(log.get("id").is_none());

    let progress = client.recv().await;
    assert_eq!(progress["method"], json!("Progress"));
    assert_eq!(progress["params"]["progress"], json!(0.5));

    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(2));

    running.server.token().cancel();
}
