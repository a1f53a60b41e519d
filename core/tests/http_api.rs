use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flowscope_core::api::serve;
use flowscope_core::{FlowService, ServiceConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestServer {
    base: String,
    stop: Option<oneshot::Sender<()>>,
    _dir: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        storage_path: dir.path().to_path_buf(),
        ..ServiceConfig::default()
    };
    let service = Arc::new(FlowService::open(config).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(serve(listener, service, async {
        let _ = stopped.await;
    }));

    TestServer {
        base,
        stop: Some(stop),
        _dir: dir,
    }
}

/// One-shot upstream that answers every connection with `response`.
async fn mock_upstream(response: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{}", addr)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires opening local TCP ports"]
async fn ingest_then_query_over_http() {
    let server = start_server().await;
    let client = client();

    for (id, status) in [("one", 200), ("two", 500)] {
        let response = client
            .post(format!("{}/api/ingest", server.base))
            .json(&json!({
                "type": "flow",
                "data": {
                    "id": id,
                    "ts": 1.0,
                    "method": "GET",
                    "url": format!("https://svc.local/{id}"),
                    "status": status,
                    "resp_body_b64": STANDARD.encode(id),
                }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let listed: Vec<Value> = client
        .get(format!("{}/api/flows?where=status%3D500", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "two");

    let count: Value = client
        .get(format!("{}/api/flows/count", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(count["count"], 2);

    let bad = client
        .get(format!("{}/api/flows?where=status%20%3E%3D", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
    let detail: Value = bad.json().await.unwrap();
    assert!(detail["detail"].is_string());

    let missing = client
        .get(format!("{}/api/flows/nope", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let body: Value = client
        .get(format!("{}/api/flows/one/response/body", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["body_b64"], STANDARD.encode("one"));

    let rejected = client
        .post(format!("{}/api/ingest", server.base))
        .json(&json!({"type": "websocket", "data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires opening local TCP ports"]
async fn event_stream_delivers_ingested_flow() {
    let server = start_server().await;
    let client = client();

    let mut response = client
        .get(format!("{}/api/events", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let first = response.chunk().await.unwrap().expect("retry frame");
    assert!(first.starts_with(b"retry: 1000"));

    client
        .post(format!("{}/api/ingest", server.base))
        .json(&json!({
            "type": "flow",
            "data": {"id": "live", "ts": 5.0, "url": "https://svc.local/live"}
        }))
        .send()
        .await
        .unwrap();

    let mut received = String::new();
    while !received.contains("\n\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("event arrives")
            .unwrap()
            .expect("stream open");
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    let data = received
        .strip_prefix("data: ")
        .and_then(|rest| rest.split("\n\n").next())
        .expect("data frame");
    let event: Value = serde_json::from_str(data).unwrap();
    assert_eq!(event["type"], "flow");
    assert_eq!(event["data"]["id"], "live");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires opening local TCP ports"]
async fn scope_update_and_check() {
    let server = start_server().await;
    let client = client();

    let saved: Value = client
        .put(format!("{}/api/scope", server.base))
        .json(&json!({"include": [" *example.com* ", ""], "drop": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(saved["include"], json!(["*example.com*"]));
    assert_eq!(saved["exclude"], json!([]));
    assert_eq!(saved["drop"], true);

    let decision: Value = client
        .get(format!(
            "{}/api/scope/check?url=https%3A%2F%2Fother.org%2F",
            server.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(decision["in_scope"], false);
    assert_eq!(decision["drop"], true);

    let unknown = client
        .put(format!("{}/api/scope", server.base))
        .json(&json!({"patterns": ["x"], "bogus": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires opening local TCP ports"]
async fn replay_token_fetches_upstream_with_base_href() {
    let upstream = mock_upstream(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\nContent-Length: 41\r\n\r\n<html><head></head><body>hi</body></html>",
    )
    .await;
    let server = start_server().await;
    let client = client();

    let ticket: Value = client
        .post(format!("{}/api/replay/open", server.base))
        .json(&json!({"method": "GET", "url": format!("{upstream}/app/page?x=1")}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let path = ticket["url"].as_str().unwrap().to_string();
    assert!(path.starts_with("/replay/"));
    assert!(ticket["browser_url"].as_str().unwrap().contains("__nsp="));

    let token = path.trim_start_matches("/replay/");
    let spec: Value = client
        .get(format!("{}/api/replay/{}", server.base, token))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(spec["method"], "GET");

    let replayed = client
        .get(format!("{}{}", server.base, path))
        .send()
        .await
        .unwrap();
    assert_eq!(replayed.status(), 200);
    let html = replayed.text().await.unwrap();
    assert!(html.contains(&format!("<base href=\"{upstream}/app/\">")));

    let expired = client
        .get(format!("{}/replay/not-a-token", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(expired.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires opening local TCP ports"]
async fn repeat_returns_preview() {
    let upstream = mock_upstream(
        "HTTP/1.1 201 Created\r\nX-Test: yes\r\nConnection: close\r\nContent-Length: 5\r\n\r\nhello",
    )
    .await;
    let server = start_server().await;

    let repeated: Value = client()
        .post(format!("{}/api/repeat", server.base))
        .json(&json!({
            "method": "post",
            "url": format!("{upstream}/submit"),
            "headers": "Content-Type: text/plain\nX-Trace: 1",
            "body": "payload",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(repeated["status"], 201);
    assert_eq!(repeated["preview"], "hello");
    assert_eq!(repeated["bytes"], 5);
    assert_eq!(repeated["body_first64k_b64"], STANDARD.encode("hello"));
    assert!(repeated["headers"].as_str().unwrap().contains("x-test: yes"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "Requires opening local TCP ports"]
async fn replay_surfaces_redirect_with_absolute_location() {
    let upstream = mock_upstream(
        "HTTP/1.1 302 Found\r\nLocation: ../login\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let server = start_server().await;
    let client = client();

    let ticket: Value = client
        .post(format!("{}/api/replay/open", server.base))
        .json(&json!({"method": "GET", "url": format!("{upstream}/app/page")}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let path = ticket["url"].as_str().unwrap();

    let replayed = client
        .get(format!("{}{}", server.base, path))
        .send()
        .await
        .unwrap();
    assert_eq!(replayed.status(), 302);
    assert_eq!(
        replayed.headers()["location"].to_str().unwrap(),
        format!("{upstream}/login")
    );
}
