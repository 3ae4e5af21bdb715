//! Control surface tests against a served router
//!
//! The storage client stays disconnected, which exercises the degraded
//! paths; endpoints that do not need the store (CID computation, registry,
//! subscriber CRUD) are exercised for real.

use metakv::api::{build_router, AppState};
use metakv::leader::Election;
use metakv::registry::Registry;
use metakv::storage::StorageClient;
use metakv::watcher::{Dispatcher, FileWatcher};
use metakv::Config;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

struct TestServer {
    base: String,
    client: reqwest::Client,
    _dir: TempDir,
}

async fn spawn_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let files_path = dir.path().join("files");
    std::fs::create_dir_all(&files_path).unwrap();
    std::fs::write(files_path.join("zeros.bin"), vec![0u8; 100 * 1024]).unwrap();
    std::fs::write(dir.path().join("outside.txt"), b"secret").unwrap();

    let config = Arc::new(Config {
        root_path: dir.path().join("meta"),
        files_path,
        service_name: "metakv-test".into(),
        watch_folders: vec![],
        ..Default::default()
    });

    let storage = Arc::new(StorageClient::new(""));
    let election = Arc::new(Election::new(config.clone(), storage.clone()));
    let registry = Arc::new(Registry::new(config.clone()));
    let dispatcher = Arc::new(Dispatcher::new());
    let watcher = FileWatcher::new(&config, dispatcher.clone());

    let state = AppState {
        config,
        election,
        registry,
        storage,
        watcher: Some(watcher),
        dispatcher: Some(dispatcher),
        started_at: Instant::now(),
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json(&self, path: &str) -> (reqwest::StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }
}

#[tokio::test]
async fn test_health_reports_degraded_without_store() {
    let server = spawn_server().await;

    let (status, body) = server.get_json("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["redis"], false);
    assert_eq!(body["role"], "unknown");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_status_carries_service_identity() {
    let server = spawn_server().await;

    let (status, body) = server.get_json("/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["serviceName"], "metakv-test");
    assert_eq!(body["fileCount"], 0);
    assert!(body["uptimeSeconds"].is_u64());
}

#[tokio::test]
async fn test_leader_unavailable_is_503() {
    let server = spawn_server().await;

    let (status, body) = server.get_json("/leader").await;
    assert_eq!(status, 503);
    assert_eq!(body["message"], "no leader available");
    assert!(body["error"].is_string());

    let (status, body) = server.get_json("/role").await;
    assert_eq!(status, 200);
    assert_eq!(body["role"], "unknown");
}

#[tokio::test]
async fn test_metadata_requires_store() {
    let server = spawn_server().await;

    for path in ["/meta", "/meta/abc123", "/meta/abc123/title", "/data/abc123/path"] {
        let (status, body) = server.get_json(path).await;
        assert_eq!(status, 503, "{} should be unavailable", path);
        assert_eq!(body["message"], "storage not connected");
    }

    let response = server
        .client
        .head(server.url("/data/abc123"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_malformed_json_body_is_400() {
    let server = spawn_server().await;

    let response = server
        .client
        .post(server.url("/file/cid"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_compute_cid_for_known_bytes() {
    let server = spawn_server().await;

    let response = server
        .client
        .post(server.url("/file/cid"))
        .json(&json!({ "path": "zeros.bin" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["cid"],
        "bafkreih45ru5yr3kwriy6clwwxrwyousdkkkfwnsgo7mwqskpmy57zch5q"
    );
    assert_eq!(body["size"], 100 * 1024);
    assert_eq!(body["path"], "zeros.bin");
}

#[tokio::test]
async fn test_compute_cid_rejects_escape() {
    let server = spawn_server().await;

    let response = server
        .client
        .post(server.url("/file/cid"))
        .json(&json!({ "path": "../outside.txt" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .post(server.url("/file/cid"))
        .json(&json!({ "path": "missing.bin" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_services_empty_and_missing() {
    let server = spawn_server().await;

    let (status, body) = server.get_json("/services").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 0);

    let (status, _) = server.get_json("/services/nobody").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_subscriber_crud() {
    let server = spawn_server().await;

    // Register
    let response = server
        .client
        .post(server.url("/api/events/subscribers"))
        .json(&json!({ "url": "http://peer:9000/hook" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Re-register with a filter: replace, not duplicate
    let response = server
        .client
        .post(server.url("/api/events/subscribers"))
        .json(&json!({ "url": "http://peer:9000/hook", "eventTypes": ["delete"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let (status, body) = server.get_json("/api/events/subscribers").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 1);
    assert_eq!(body["subscribers"][0]["eventTypes"], json!(["delete"]));
    assert_eq!(body["subscribers"][0]["failCount"], 0);

    // Missing URL is rejected
    let response = server
        .client
        .post(server.url("/api/events/subscribers"))
        .json(&json!({ "url": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Unsubscribe
    let response = server
        .client
        .delete(server.url("/api/events/subscribers"))
        .json(&json!({ "url": "http://peer:9000/hook" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let (_, body) = server.get_json("/api/events/subscribers").await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_poll_and_scan_status() {
    let server = spawn_server().await;

    let (status, body) = server.get_json("/api/events/poll?since=0&limit=10").await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 0);

    let (status, body) = server.get_json("/api/scan/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["scanning"], false);
}

#[tokio::test]
async fn test_cors_headers_present() {
    let server = spawn_server().await;

    let response = server
        .client
        .request(reqwest::Method::OPTIONS, server.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_sse_stream_sends_connected_handshake() {
    let server = spawn_server().await;

    let mut response = server
        .client
        .get(server.url("/api/events/subscribe"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), response.chunk())
        .await
        .expect("no handshake within deadline")
        .unwrap()
        .expect("stream ended early");
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("event: connected"));
    assert!(text.contains(r#"data: {"status":"connected"}"#));
}

#[tokio::test]
async fn test_file_by_cid_requires_store() {
    let server = spawn_server().await;

    let (status, _) = server.get_json("/file/bafkreiabc").await;
    assert_eq!(status, 503);
}
