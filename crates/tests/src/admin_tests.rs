//! Admin surface: authentication semantics and snapshot contents.

use tower::ServiceExt;
use turnstile_core::store::EffectiveCount;

use crate::mock_infrastructure::{body_json, TestProxy, TestProxyOptions};

fn admin_request(path: &str, key: Option<&str>) -> axum::http::Request<axum::body::Body> {
    let mut builder = axum::http::Request::builder().uri(path);
    if let Some(key) = key {
        builder = builder.header("X-Admin-Key", key);
    }
    builder.body(axum::body::Body::empty()).unwrap()
}

#[tokio::test]
async fn test_admin_disabled_when_key_unset() {
    let proxy = TestProxy::build(TestProxyOptions::default());

    for path in ["/status", "/ratelimitstatus", "/blackliststatus"] {
        let response =
            proxy.router.clone().oneshot(admin_request(path, Some("whatever"))).await.unwrap();
        assert_eq!(response.status(), 403, "{path} must be disabled without a key");
    }
}

#[tokio::test]
async fn test_admin_auth_codes() {
    let proxy = TestProxy::build(TestProxyOptions {
        admin_key: Some("hunter2".into()),
        ..TestProxyOptions::default()
    });

    let missing = proxy.router.clone().oneshot(admin_request("/status", None)).await.unwrap();
    assert_eq!(missing.status(), 401);

    let wrong =
        proxy.router.clone().oneshot(admin_request("/status", Some("nope"))).await.unwrap();
    assert_eq!(wrong.status(), 403);

    let right =
        proxy.router.clone().oneshot(admin_request("/status", Some("hunter2"))).await.unwrap();
    assert_eq!(right.status(), 200);
}

#[tokio::test]
async fn test_breaker_status_shape() {
    let proxy = TestProxy::build(TestProxyOptions {
        admin_key: Some("k".into()),
        fallback_url: Some("http://127.0.0.1:9".into()),
        ..TestProxyOptions::default()
    });

    let response =
        proxy.router.clone().oneshot(admin_request("/status", Some("k"))).await.unwrap();
    let json = body_json(response).await;

    assert_eq!(json["state"], "closed");
    assert_eq!(json["consecutiveFailures"], 0);
    assert_eq!(json["hasFallback"], true);
    assert_eq!(json["failureThreshold"], 2);
    assert!(json["uptime"].is_string());
}

#[tokio::test]
async fn test_rate_limit_status_shape() {
    let proxy = TestProxy::build(TestProxyOptions {
        admin_key: Some("k".into()),
        ..TestProxyOptions::default()
    });

    proxy
        .store
        .origin_hourly
        .lock()
        .push(("a.test".to_string(), EffectiveCount::new(3, 4, 0.5)));
    proxy.state.limiter.poll_once().await;

    let response = proxy
        .router
        .clone()
        .oneshot(admin_request("/ratelimitstatus", Some("k")))
        .await
        .unwrap();
    let json = body_json(response).await;

    let weight = json["slidingWindow"]["previousHourWeight"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&weight));
    assert!(json["slidingWindow"]["secondsToNextHour"].as_i64().unwrap() > 0);
    assert!(json["slidingWindow"]["secondsToNextMidnight"].as_i64().unwrap() > 0);
    assert_eq!(json["summary"]["trackedOrigins"], 1);
    assert_eq!(json["features"]["sliding_window"], true);
    assert_eq!(json["limits"]["origin_hourly"], 1000);
    assert!(json["originCounts"]["a.test"]["current"].as_i64().is_some());
}

#[tokio::test]
async fn test_blacklist_status_shape() {
    let proxy = TestProxy::build(TestProxyOptions {
        admin_key: Some("k".into()),
        ..TestProxyOptions::default()
    });

    let response = proxy
        .router
        .clone()
        .oneshot(admin_request("/blackliststatus", Some("k")))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["enabled"], false);
    assert_eq!(json["entries"], 0);
}

#[tokio::test]
async fn test_watchdog_requires_no_key() {
    let proxy = TestProxy::build(TestProxyOptions {
        admin_key: Some("k".into()),
        ..TestProxyOptions::default()
    });

    let response =
        proxy.router.clone().oneshot(admin_request("/watchdog", None)).await.unwrap();
    assert_eq!(response.status(), 200);
}
