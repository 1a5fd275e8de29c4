//! End-to-end flow against a fake upstream pool: login handshake, job
//! broadcast into the registry, and the miner-facing HTTP replies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use eth_proxy::getwork::{self, GetworkService};
use eth_proxy::jobs::JobRegistry;
use eth_proxy::upstream::{SessionController, UpstreamClient};

const WALLET: &str = "1234567890123456789012345678901234567890";

/// Minimal Stratum pool: acks the login, broadcasts one job, then keeps
/// acking whatever else arrives (pings, submissions).
async fn fake_pool(listener: TcpListener, job: Value, login_tx: oneshot::Sender<Value>) {
    let (stream, _) = listener.accept().await.expect("accept");
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let first = lines.next_line().await.expect("read login").expect("login line");
    let login: Value = serde_json::from_str(&first).expect("login is json");
    let ack = json!({"id": login["id"], "result": true, "error": null});
    write_half.write_all(format!("{}\n", ack).as_bytes()).await.expect("ack login");
    let _ = login_tx.send(login);

    let notification = json!({"id": 0, "result": job});
    write_half
        .write_all(format!("{}\n", notification).as_bytes())
        .await
        .expect("broadcast job");

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => break,
        };
        let ack = json!({"id": msg["id"], "result": true, "error": null});
        if write_half.write_all(format!("{}\n", ack).as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn serve_http(registry: Arc<JobRegistry>, enable_worker_id: bool) -> SocketAddr {
    let listener = getwork::listener::bind("127.0.0.1:0".parse().unwrap()).expect("bind http");
    let addr = listener.local_addr().expect("local addr");
    let service = GetworkService::new(registry, enable_worker_id);
    let app = getwork::listener::router(service);
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("http server");
    });
    addr
}

async fn post(addr: SocketAddr, path: &str, body: &str) -> String {
    reqwest::Client::new()
        .post(format!("http://{}{}", addr, path))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body")
}

#[tokio::test]
async fn job_flows_from_pool_to_miner() {
    let pool_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let pool_addr = pool_listener.local_addr().unwrap();
    let job = json!(["0xaaa", "0xbbb", "0xccc"]);
    let (login_tx, login_rx) = oneshot::channel();
    tokio::spawn(fake_pool(pool_listener, job, login_tx));

    let client = UpstreamClient::new(
        "main",
        "127.0.0.1",
        pool_addr.port(),
        false,
        false,
        Arc::new(Notify::new()),
    );
    let registry = JobRegistry::new(vec![Arc::clone(&client)], 360);
    SessionController::new(
        Arc::clone(&client),
        Arc::clone(&registry),
        WALLET.to_string(),
        String::new(),
        false,
    )
    .spawn();

    let mut changes = registry.subscribe_changes();
    client.spawn();

    // login handshake: first issued request id is 2, wallet + client name set
    let login = timeout(Duration::from_secs(5), login_rx).await.expect("login sent").unwrap();
    assert_eq!(login["method"], "eth_submitLogin");
    assert_eq!(login["id"], 2);
    assert_eq!(login["jsonrpc"], "2.0");
    assert_eq!(login["params"][0], WALLET);
    assert!(login["worker"].as_str().unwrap().starts_with("Proxy_"));

    // the broadcast job lands in the registry and fires the change signal
    timeout(Duration::from_secs(5), changes.changed()).await.expect("job change").unwrap();
    let cached = registry.current_job().expect("cached job");
    assert_eq!(cached.header_hash(), "0xaaa");
    assert!(client.is_connected());

    // and the miner gets it, byte for byte
    let http_addr = serve_http(Arc::clone(&registry), false).await;
    let body = post(
        http_addr,
        "/",
        r#"{"id":1,"jsonrpc":"2.0","method":"eth_getWork","params":[]}"#,
    )
    .await;
    assert_eq!(body, "{\"id\":1,\"jsonrpc\":\"2.0\",\"result\":[\"0xaaa\",\"0xbbb\",\"0xccc\"]}\n");
}

#[tokio::test]
async fn request_before_first_job_gets_waiting_error() {
    let registry = JobRegistry::new(Vec::new(), 360);
    let http_addr = serve_http(registry, false).await;

    let body = post(
        http_addr,
        "/",
        r#"{"id":1,"jsonrpc":"2.0","method":"eth_getWork","params":[]}"#,
    )
    .await;
    assert_eq!(
        body,
        "{\"id\":1,\"jsonrpc\":\"2.0\",\"result\":false,\"error\":\"Proxy is waiting for a job...\"}\n"
    );
}

#[tokio::test]
async fn submissions_are_acked_optimistically_and_attributed() {
    let pool_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let pool_addr = pool_listener.local_addr().unwrap();
    let (login_tx, _login_rx) = oneshot::channel();
    tokio::spawn(fake_pool(pool_listener, json!(["0xaaa", "0xbbb", "0xccc"]), login_tx));

    let client = UpstreamClient::new(
        "main",
        "127.0.0.1",
        pool_addr.port(),
        false,
        false,
        Arc::new(Notify::new()),
    );
    let registry = JobRegistry::new(vec![Arc::clone(&client)], 360);
    SessionController::new(
        Arc::clone(&client),
        Arc::clone(&registry),
        WALLET.to_string(),
        String::new(),
        false,
    )
    .spawn();
    let mut changes = registry.subscribe_changes();
    client.spawn();
    timeout(Duration::from_secs(5), changes.changed()).await.expect("job change").unwrap();

    let http_addr = serve_http(Arc::clone(&registry), true).await;

    // the miner is acked before any upstream round trip completes
    let body = post(
        http_addr,
        "/rig1/extra",
        r#"{"id":4,"jsonrpc":"2.0","method":"eth_submitWork","params":["0x1","0x2","0x3"]}"#,
    )
    .await;
    assert_eq!(body, "{\"id\":4,\"jsonrpc\":\"2.0\",\"result\":true}\n");

    let body = post(
        http_addr,
        "/rig1",
        r#"{"id":5,"jsonrpc":"2.0","method":"eth_submitHashrate","params":["0x1E84800","0x01"]}"#,
    )
    .await;
    assert_eq!(body, "{\"id\":5,\"jsonrpc\":\"2.0\",\"result\":true}\n");

    let body = post(
        http_addr,
        "/",
        r#"{"id":6,"jsonrpc":"2.0","method":"eth_getBalance","params":[]}"#,
    )
    .await;
    assert_eq!(
        body,
        "{\"id\":6,\"jsonrpc\":\"2.0\",\"result\":false,\"error\":\"Unsupported method 'eth_getBalance'\"}\n"
    );

    let body = post(http_addr, "/", "this is not json").await;
    assert_eq!(
        body,
        "{\"id\":0,\"jsonrpc\":\"2.0\",\"result\":false,\"error\":\"Cannot decode request body\"}\n"
    );
}
