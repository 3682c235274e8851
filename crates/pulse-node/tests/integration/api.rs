//! Local API driving a live producer session.

use std::sync::Arc;

use pulse_session::ConnectionState;

use crate::harness::{TestProducer, TestViewer, VIEWER_NAME};

const TOKEN: &str = "integration-token";

async fn serve(producer: &TestProducer) -> String {
    let router = pulse_api::router(Arc::new(producer.producer.api_state(TOKEN.into())));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

async fn post(base: &str, path: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
    let resp = reqwest::Client::new()
        .post(format!("{base}{path}"))
        .header("Authorization", format!("Bearer {TOKEN}"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let json = resp.json().await.unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_api_observes_and_controls_session() {
    let viewer = TestViewer::start(false).await.unwrap();
    let producer = TestProducer::start(viewer.handle.local_addr());
    producer.wait_streaming().await.unwrap();
    let base = serve(&producer).await;

    let (status, json) = post(&base, "/api/v1/status", serde_json::json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(json["state"], "connected");
    assert_eq!(json["is_enabled"], true);

    let (_, json) = post(&base, "/api/v1/peers", serde_json::json!({})).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["peers"][0]["name"], VIEWER_NAME);
    assert_eq!(json["peers"][0]["is_selected"], true);

    producer.log("via api test");
    let (_, json) = post(&base, "/api/v1/messages", serde_json::json!({ "limit": 10 })).await;
    assert_eq!(json["messages"][0]["text"], "via api test");

    let (status, _) = post(&base, "/api/v1/connect", serde_json::json!({ "name": "Nobody" })).await;
    assert_eq!(status, 404);

    let (status, _) = post(&base, "/api/v1/disable", serde_json::json!({})).await;
    assert_eq!(status, 200);
    producer.wait_state(ConnectionState::Idle).await.unwrap();

    let (status, _) = post(&base, "/api/v1/enable", serde_json::json!({})).await;
    assert_eq!(status, 200);
    // Selection was kept, so rediscovery reconnects on its own
    producer.wait_streaming().await.unwrap();

    producer.shutdown().await;
    viewer.shutdown().await;
}
