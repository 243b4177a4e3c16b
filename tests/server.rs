mod helpers;

use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use cms_mirror::models::CollectionKey;
use cms_mirror::pipeline::Pipeline;
use cms_mirror::server::router;
use cms_mirror::state::MemoryStateBackend;
use helpers::*;

struct TestServer {
    base: String,
    source: Arc<FakeSource>,
    destination: Arc<FakeDestination>,
}

async fn start(destination: FakeDestination) -> TestServer {
    let source = Arc::new(FakeSource::new());
    let destination = Arc::new(destination);
    let pipeline = Pipeline::new(
        source.clone(),
        destination.clone(),
        Arc::new(MemoryStateBackend::new()),
        settings(),
    );
    let app = router(Arc::new(pipeline), Arc::new(AtomicBool::new(false)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        source,
        destination,
    }
}

async fn post_sync(server: &TestServer, body: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/sync", server.base))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_reports_version() {
    let server = start(FakeDestination::new(true)).await;
    let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn full_sync_returns_report() {
    let server = start(FakeDestination::new(true)).await;
    server.source.put(material("m1", "holz", "Holz", "Wood"));
    server.source.put(material("m2", "stein", "Stein", "Stone"));

    let resp = post_sync(&server, "").await;
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["created"], 2);
    assert_eq!(report["total_synced"], 2);
    assert_eq!(report["cancelled"], false);
    assert_eq!(server.destination.ids(CollectionKey::Material).len(), 2);
}

#[tokio::test]
async fn single_item_sync_over_http() {
    let server = start(FakeDestination::new(true)).await;
    server.source.put(material("m1", "holz", "Holz", "Wood"));
    server.source.put(material("m2", "stein", "Stein", "Stone"));

    let resp = post_sync(
        &server,
        r#"{"mode":"single","collection":"material","itemId":"m2"}"#,
    )
    .await;
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["created"], 1);
    assert_eq!(report["deleted"], 0);
}

#[tokio::test]
async fn invalid_request_is_400() {
    let server = start(FakeDestination::new(true)).await;

    let resp = post_sync(&server, r#"{"mode":"single","itemId":"w1"}"#).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = post_sync(&server, r#"{"collection":"sculpture"}"#).await;
    assert_eq!(resp.status(), 400);

    assert!(server.destination.calls().is_empty());
}

#[tokio::test]
async fn sync_requires_post() {
    let server = start(FakeDestination::new(true)).await;
    let resp = reqwest::get(format!("{}/sync", server.base)).await.unwrap();
    assert_eq!(resp.status(), 405);
}

#[tokio::test]
async fn streamed_sync_ends_with_result() {
    let server = start(FakeDestination::new(true)).await;
    server.source.put(material("m1", "holz", "Holz", "Wood"));

    let resp = post_sync(&server, &json!({ "stream": true }).to_string()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );

    let text = resp.text().await.unwrap();
    let events: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(events[0]["event"], "phase");
    assert!(events
        .iter()
        .any(|e| e["event"] == "collection_finished" && e["report"]["collection"] == "material"));
    let last = events.last().unwrap();
    assert_eq!(last["event"], "result");
    assert_eq!(last["report"]["created"], 1);
}

#[tokio::test]
async fn overlapping_runs_are_rejected() {
    let server = start(FakeDestination::new(true).with_delay(Duration::from_millis(150))).await;
    server.source.put(material("m1", "holz", "Holz", "Wood"));

    let first = {
        let base = server.base.clone();
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("{}/sync", base))
                .send()
                .await
                .unwrap()
                .status()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = post_sync(&server, "").await;
    assert_eq!(second.status(), 409);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"]["code"], "run_in_progress");

    assert_eq!(first.await.unwrap(), 200);
}
