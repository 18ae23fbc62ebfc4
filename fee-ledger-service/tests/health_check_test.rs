mod common;

use common::spawn_app;

#[tokio::test]
async fn health_check_works() {
    let app = spawn_app().await;

    let response = app.get("/health").await;

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "fee-ledger-service-test");
}

#[tokio::test]
async fn readiness_check_works() {
    let app = spawn_app().await;

    let response = app.get("/ready").await;

    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn metrics_are_exposed_as_text() {
    let app = spawn_app().await;

    // Touch a counter so the registry is not empty.
    app.get("/finance/dashboard").await;
    let response = app.get("/metrics").await;

    assert_eq!(response.status().as_u16(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = response.text().await.unwrap();
    assert!(body.contains("fee_ledger_"));
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(app.url("/health"))
        .header("x-request-id", "test-request-42")
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers()["x-request-id"], "test-request-42");
}

#[tokio::test]
async fn request_id_is_generated_when_missing() {
    let app = spawn_app().await;

    let response = app.get("/health").await;

    assert!(response.headers().contains_key("x-request-id"));
}
