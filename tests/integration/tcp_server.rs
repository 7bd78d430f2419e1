/// Accept policies of the TCP server
use crate::support::*;
use game_rpcd::ServePolicy;
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::test]
async fn test_close_after_first_serves_one_connection() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::CloseAfterFirst).await;

    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;
    client.request(2, "Ping", json!({})).await;
    assert_eq!(client.recv().await["result"], json!({}));

    // The listener is gone once the first connection was accepted
    assert!(TcpStream::connect(running.addr).await.is_err());

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("server should return once its connection closed")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_keep_alive_serves_many_connections() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::KeepAlive).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = TestClient::connect(running.addr).await;
        client.authenticate(1).await;
        clients.push(client);
    }
    for (i, client) in clients.iter_mut().enumerate() {
        client.request(100 + i as i64, "Ping", json!({})).await;
        assert_eq!(client.recv().await["id"], json!(100 + i as i64));
    }

    // Each connection authenticates on its own
    let mut late = TestClient::connect(running.addr).await;
    late.request(1, "Ping", json!({})).await;
    assert!(late.recv_within(Duration::from_millis(200)).await.is_none());

    running.server.token().cancel();
    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("cancelling the server closes every connection")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_garbage_lines_do_not_kill_the_connection() {
    let running = spawn_tcp(builtin_router(|_| {}), ServePolicy::KeepAlive).await;
    let mut client = TestClient::connect(running.addr).await;
    client.authenticate(1).await;

    client.send(json!("not an envelope")).await;
    client.send(json!({"jsonrpc": "1.0", "id": 5, "method": "Ping"})).await;
    client.request(6, "Ping", json!({})).await;

    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(6));

    running.server.token().cancel();
}
