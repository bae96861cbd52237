//! Rate-limit denials and admission precedence through the router.

use std::io::Write;
use tower::ServiceExt;
use turnstile_core::{limiter::LimitsConfig, store::EffectiveCount};

use crate::mock_infrastructure::{body_json, rpc_request, TestProxy, TestProxyOptions};

const RPC_BODY: &str = r#"{"jsonrpc":"2.0","method":"eth_call","id":7}"#;

fn tight_limits() -> LimitsConfig {
    LimitsConfig { origin_hourly: 10, ip_hourly: 10, origin_daily: 100, ip_daily: 100 }
}

#[tokio::test]
async fn test_sliding_window_denial_skips_upstream() {
    let mut upstream = mockito::Server::new_async().await;
    let upstream_mock = upstream.mock("POST", "/").expect(0).create_async().await;

    let proxy = TestProxy::build(TestProxyOptions {
        primary_url: upstream.url(),
        limits: tight_limits(),
        ..TestProxyOptions::default()
    });

    // current 8, previous 10 at weight 0.5: effective 13 > limit 10.
    proxy
        .store
        .origin_hourly
        .lock()
        .push(("a.test".to_string(), EffectiveCount::new(8, 10, 0.5)));
    assert!(proxy.state.limiter.poll_once().await);

    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(RPC_BODY, &[("origin", "https://a.test")]))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32005);
    assert_eq!(json["error"]["message"], "Rate limit exceeded.");
    assert_eq!(json["id"], 7);
    let retry_after = json["error"]["data"]["retryAfter"].as_i64().unwrap();
    assert!(retry_after > 0 && retry_after <= 3600, "hourly retry-after, got {retry_after}");

    upstream_mock.assert_async().await;
}

#[tokio::test]
async fn test_daily_denial_uses_midnight_retry_after() {
    let proxy = TestProxy::build(TestProxyOptions {
        limits: tight_limits(),
        ..TestProxyOptions::default()
    });

    proxy.store.origin_daily.lock().push(("a.test".to_string(), 101));
    proxy.state.limiter.poll_once().await;

    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(RPC_BODY, &[("origin", "https://a.test")]))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32005);
    let retry_after = json["error"]["data"]["retryAfter"].as_i64().unwrap();
    assert!(retry_after > 0 && retry_after <= 86_400);
}

#[tokio::test]
async fn test_local_origin_judged_by_ip_tier() {
    let proxy = TestProxy::build(TestProxyOptions {
        limits: tight_limits(),
        ..TestProxyOptions::default()
    });

    // The router's test peer is 198.51.100.7.
    proxy
        .store
        .ip_hourly
        .lock()
        .push(("198.51.100.7".to_string(), EffectiveCount::new(11, 0, 1.0)));
    proxy.state.limiter.poll_once().await;

    // Local-like origin: blocked through the IP tier.
    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(RPC_BODY, &[("origin", "http://localhost:3000")]))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32005);
}

#[tokio::test]
async fn test_blacklist_precedes_limiter() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "198.51.100.7").unwrap();
    file.flush().unwrap();

    let proxy = TestProxy::build(TestProxyOptions {
        blacklist_path: Some(file.path().to_path_buf()),
        limits: tight_limits(),
        ..TestProxyOptions::default()
    });

    // The limiter would also deny this request; the blacklist must win.
    proxy
        .store
        .ip_hourly
        .lock()
        .push(("198.51.100.7".to_string(), EffectiveCount::new(50, 0, 1.0)));
    proxy.state.limiter.poll_once().await;

    let response = proxy.router.clone().oneshot(rpc_request(RPC_BODY, &[])).await.unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32000);
    assert_eq!(json["id"], 7);
}

#[tokio::test]
async fn test_limited_batch_echoes_null_id() {
    let proxy = TestProxy::build(TestProxyOptions {
        limits: tight_limits(),
        ..TestProxyOptions::default()
    });

    proxy.store.origin_daily.lock().push(("a.test".to_string(), 999));
    proxy.state.limiter.poll_once().await;

    let body = r#"[
        {"jsonrpc":"2.0","method":"eth_call","id":1},
        {"jsonrpc":"2.0","method":"eth_chainId","id":2}
    ]"#;
    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(body, &[("origin", "https://a.test")]))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32005);
    assert_eq!(json["id"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_stale_blocklist_survives_poll_failures() {
    let proxy = TestProxy::build(TestProxyOptions {
        limits: tight_limits(),
        ..TestProxyOptions::default()
    });

    proxy.store.origin_hourly.lock().push(("a.test".to_string(), EffectiveCount::new(20, 0, 0.5)));
    proxy.state.limiter.poll_once().await;

    *proxy.store.fail_reads.lock() = true;
    for _ in 0..3 {
        assert!(!proxy.state.limiter.poll_once().await);
    }

    let response = proxy
        .router
        .clone()
        .oneshot(rpc_request(RPC_BODY, &[("origin", "https://a.test")]))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32005, "known offender stays blocked on stale data");
}
