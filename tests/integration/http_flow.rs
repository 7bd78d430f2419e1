/// HTTP dual-channel transport in front of the real router
use crate::support::*;
use futures::StreamExt;
use game_rpcd::transport::http::{CALL_ID_HEADER, CID_HEADER, SECRET_HEADER};
use game_rpcd::{HttpGateway, Server};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn post(client: &reqwest::Client, url: String, cid: &str) -> reqwest::RequestBuilder {
    client
        .post(url)
        .header(SECRET_HEADER, secret())
        .header(CID_HEADER, cid)
}

async fn serve_gateway(keep_alive: Duration) -> (HttpGateway, String) {
    let gateway = HttpGateway::with_keep_alive(
        secret(),
        builtin_router(|_| {}),
        &CancellationToken::new(),
        keep_alive,
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = gateway.router();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (gateway, base)
}

/// Read SSE frames until one carries `method`; returns its `id:` and data
async fn next_event_for<S, B>(chunks: &mut S, method: &str) -> (String, Value)
where
    S: futures::Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut buffer = String::new();
    loop {
        if let Some(end) = buffer.find("\n\n") {
            let block: String = buffer.drain(..end + 2).collect();
            let mut id = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("id:") {
                    id = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data = Some(rest.trim().to_string());
                }
            }
            if let (Some(id), Some(data)) = (id, data) {
                let message: Value = serde_json::from_str(&data).unwrap();
                if message["method"] == json!(method) {
                    return (id, message);
                }
            }
            continue;
        }

        let chunk = tokio::time::timeout(Duration::from_secs(5), chunks.next())
            .await
            .expect("timed out waiting for feed event")
            .expect("feed ended")
            .unwrap();
        buffer.push_str(&String::from_utf8_lossy(chunk.as_ref()));
    }
}

#[tokio::test]
async fn test_call_and_graceful_stop_through_server() {
    let router = builtin_router(|_| {});
    let server = Arc::new(Server::new(router.clone(), secret()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve_http(listener).await });
    let client = reqwest::Client::new();

    let resp = post(&client, format!("{}/call/Ping", base), "c1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({}));

    let resp = client
        .post(format!("{}/call/Ping", base))
        .header(CID_HEADER, "c1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = post(&client, format!("{}/call/Meta.Shutdown", base), "c1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("HTTP server should stop after shutdown")
        .unwrap()
        .unwrap();
    assert!(router.shutdown_signal().is_cancelled());
}

#[tokio::test]
async fn test_server_call_travels_over_feed() {
    let (_gateway, base) = serve_gateway(Duration::from_secs(15)).await;
    let client = reqwest::Client::new();

    let feed = client
        .get(format!("{}/feed?cid=gui&secret={}", base, secret()))
        .send()
        .await
        .unwrap();
    assert_eq!(feed.status(), 200);
    let mut chunks = feed.bytes_stream();

    let pending = tokio::spawn(
        post(&client, format!("{}/call/Test.DoubleTwice", base), "gui")
            .body(r#"{"number":5}"#)
            .send(),
    );

    let (call_id, request) = next_event_for(&mut chunks, "Test.Double").await;
    assert_eq!(request["params"], json!({"number": 5}));

    let resp = post(&client, format!("{}/reply", base), "gui")
        .header(CALL_ID_HEADER, call_id)
        .body(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"number": 10}}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"number": 20}));
}

#[tokio::test]
async fn test_server_call_without_feed_is_428() {
    let (_gateway, base) = serve_gateway(Duration::from_secs(15)).await;
    let client = reqwest::Client::new();

    let resp = post(&client, format!("{}/call/Test.DoubleTwice", base), "nobody")
        .body(r#"{"number":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 428);
}

#[tokio::test]
async fn test_feed_lost_mid_call_is_424() {
    let (gateway, base) = serve_gateway(Duration::from_millis(50)).await;
    let client = reqwest::Client::new();

    let feed = client
        .get(format!("{}/feed?cid=flaky&secret={}", base, secret()))
        .send()
        .await
        .unwrap();
    let mut chunks = feed.bytes_stream();

    let pending = tokio::spawn(
        post(&client, format!("{}/call/Test.DoubleTwice", base), "flaky")
            .body(r#"{"number":2}"#)
            .send(),
    );
    next_event_for(&mut chunks, "Test.Double").await;
    assert_eq!(gateway.calls_in_flight(), 1);

    drop(chunks);

    let resp = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("call should settle once the feed is gone")
        .unwrap()
        .unwrap();
    assert_eq!(resp.status(), 424);
}
