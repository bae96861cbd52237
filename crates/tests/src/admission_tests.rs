//! Admission-path tests through the full router: validation, namespace
//! filtering, and the billing of admitted traffic.

use tower::ServiceExt;

use crate::mock_infrastructure::{body_json, rpc_request, TestProxy, TestProxyOptions};

#[tokio::test]
async fn test_batch_with_blocked_namespace_never_reaches_upstream() {
    let mut upstream = mockito::Server::new_async().await;
    let upstream_mock = upstream.mock("POST", "/").expect(0).create_async().await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: upstream.url(),
        ..TestProxyOptions::default()
    });

    let body = r#"[
        {"jsonrpc":"2.0","method":"eth_blockNumber","id":1},
        {"jsonrpc":"2.0","method":"debug_traceTransaction","id":2}
    ]"#;
    let response = proxy.router.clone().oneshot(rpc_request(body, &[])).await.unwrap();

    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32601);
    assert_eq!(json["id"], 2);
    assert!(json["error"]["message"].as_str().unwrap().contains("debug"));

    upstream_mock.assert_async().await;
}

#[tokio::test]
async fn test_valid_request_relayed_and_credited() {
    let mut upstream = mockito::Server::new_async().await;
    let upstream_body = r#"{"jsonrpc":"2.0","id":"x","result":"0x01"}"#;
    let _upstream_mock = upstream
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(upstream_body)
        .create_async()
        .await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: upstream.url(),
        ..TestProxyOptions::default()
    });

    let body = r#"{"jsonrpc":"2.0","method":"eth_call","id":"x"}"#;
    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(body, &[("origin", "https://example.com/")]))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(bytes.as_ref(), upstream_body.as_bytes());

    // The aggregator saw one request for example.com from the peer IP.
    let (origins, ips) = proxy.state.aggregator.swap();
    assert_eq!(origins.get("example.com"), Some(&1));
    let stats = ips.get("198.51.100.7").unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.origins.get("example.com"), Some(&1));
}

#[tokio::test]
async fn test_batch_credits_len_to_aggregator() {
    let mut upstream = mockito::Server::new_async().await;
    let _upstream_mock = upstream
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"jsonrpc":"2.0","id":1,"result":"0x1"},{"jsonrpc":"2.0","id":2,"result":"0x2"}]"#)
        .create_async()
        .await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: upstream.url(),
        ..TestProxyOptions::default()
    });

    let body = r#"[
        {"jsonrpc":"2.0","method":"eth_call","id":1},
        {"jsonrpc":"2.0","method":"eth_chainId","id":2}
    ]"#;
    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(body, &[("origin", "https://example.com")]))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let (origins, _) = proxy.state.aggregator.swap();
    assert_eq!(origins.get("example.com"), Some(&2));
}

#[tokio::test]
async fn test_parse_error_returns_http_200() {
    let proxy = TestProxy::build(TestProxyOptions::default());

    let response = proxy.router.clone().oneshot(rpc_request("{not json", &[])).await.unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32700);
    assert_eq!(json["id"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_missing_id_rejected_without_upstream_call() {
    let mut upstream = mockito::Server::new_async().await;
    let upstream_mock = upstream.mock("POST", "/").expect(0).create_async().await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: upstream.url(),
        ..TestProxyOptions::default()
    });

    let body = r#"{"jsonrpc":"2.0","method":"eth_call"}"#;
    let response = proxy.router.clone().oneshot(rpc_request(body, &[])).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32600);

    upstream_mock.assert_async().await;
}

#[tokio::test]
async fn test_rejected_request_not_credited() {
    let proxy = TestProxy::build(TestProxyOptions::default());

    let body = r#"{"jsonrpc":"2.0","method":"miner_start","id":9}"#;
    let response = proxy.router.clone().oneshot(rpc_request(body, &[])).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32601);

    assert_eq!(proxy.state.aggregator.snapshot().pending_requests, 0);
}

#[tokio::test]
async fn test_empty_batch_rejected() {
    let proxy = TestProxy::build(TestProxyOptions::default());

    let response = proxy.router.clone().oneshot(rpc_request("[]", &[])).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32600);
    assert_eq!(json["id"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_watchdog_is_open() {
    let proxy = TestProxy::build(TestProxyOptions::default());

    let request =
        axum::http::Request::builder().uri("/watchdog").body(axum::body::Body::empty()).unwrap();
    let response = proxy.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
}
