//! E2E tests for health check and metrics

mod common;

use common::TestServer;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::new().await;

    // Generate at least one labelled sample
    server
        .client
        .get(&server.url("/users/alice"))
        .send()
        .await
        .unwrap();

    let response = server
        .client
        .get(&server.url("/metrics"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("rustread_http_requests_total"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/nowhere"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_router_serves_health_without_network() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let server = TestServer::new().await;
    let app = rustread::build_router(server.state.clone());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}
