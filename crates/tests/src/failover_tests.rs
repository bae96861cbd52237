//! Failover behavior through the router: immediate fallback retry, breaker
//! opening, and the rule that fallback traffic is never billed.

use tower::ServiceExt;
use turnstile_core::breaker::BreakerState;

use crate::mock_infrastructure::{rpc_request, TestProxy, TestProxyOptions};

const RPC_BODY: &str = r#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#;

#[tokio::test]
async fn test_immediate_fallback_serves_client_without_billing() {
    let mut primary = mockito::Server::new_async().await;
    let mut fallback = mockito::Server::new_async().await;
    let _primary_mock = primary.mock("POST", "/").with_status(502).create_async().await;
    let fallback_body = r#"{"jsonrpc":"2.0","id":1,"result":"0x02"}"#;
    let _fallback_mock = fallback
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(fallback_body)
        .create_async()
        .await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: primary.url(),
        fallback_url: Some(fallback.url()),
        failure_threshold: 5,
        ..TestProxyOptions::default()
    });

    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(RPC_BODY, &[("origin", "https://example.com")]))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(bytes.as_ref(), fallback_body.as_bytes());

    // One failure recorded, nothing billed.
    assert_eq!(proxy.breaker.consecutive_failures().await, 1);
    assert_eq!(proxy.state.aggregator.snapshot().pending_requests, 0);
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_skips_primary() {
    let mut primary = mockito::Server::new_async().await;
    let mut fallback = mockito::Server::new_async().await;
    let primary_mock = primary.mock("POST", "/").with_status(500).expect(2).create_async().await;
    let _fallback_mock = fallback
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#)
        .expect(3)
        .create_async()
        .await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: primary.url(),
        fallback_url: Some(fallback.url()),
        failure_threshold: 2,
        ..TestProxyOptions::default()
    });

    for _ in 0..2 {
        let response =
            proxy.router.clone().oneshot(rpc_request(RPC_BODY, &[])).await.unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(proxy.breaker.state().await, BreakerState::Open);

    // Open breaker: the third request must not touch the primary.
    let response = proxy.router.clone().oneshot(rpc_request(RPC_BODY, &[])).await.unwrap();
    assert_eq!(response.status(), 200);
    primary_mock.assert_async().await;

    // Fallback-mode traffic is not billed either.
    assert_eq!(proxy.state.aggregator.snapshot().pending_requests, 0);
}

#[tokio::test]
async fn test_primary_recovery_resumes_billing() {
    let mut primary = mockito::Server::new_async().await;
    let _primary_mock = primary
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#)
        .create_async()
        .await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: primary.url(),
        ..TestProxyOptions::default()
    });

    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(RPC_BODY, &[("origin", "https://example.com")]))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(proxy.state.aggregator.snapshot().pending_requests, 1);
}

#[tokio::test]
async fn test_total_failure_without_fallback_surfaces_upstream_status() {
    let mut primary = mockito::Server::new_async().await;
    let _primary_mock = primary.mock("POST", "/").with_status(503).create_async().await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: primary.url(),
        ..TestProxyOptions::default()
    });

    let response = proxy.router.clone().oneshot(rpc_request(RPC_BODY, &[])).await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(proxy.state.aggregator.snapshot().pending_requests, 0);
}

#[tokio::test]
async fn test_get_probe_relays_primary_verbatim() {
    let mut primary = mockito::Server::new_async().await;
    let _primary_mock = primary
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/plain")
        .with_body("node alive")
        .create_async()
        .await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: primary.url(),
        ..TestProxyOptions::default()
    });

    let request =
        axum::http::Request::builder().uri("/").body(axum::body::Body::empty()).unwrap();
    let response = proxy.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(bytes.as_ref(), b"node alive");

    // GET probes never feed the breaker.
    assert_eq!(proxy.breaker.consecutive_failures().await, 0);
}
