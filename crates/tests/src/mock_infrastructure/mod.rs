//! Reusable test doubles: in-memory counter store and router assembly.

use ahash::AHashMap;
use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::broadcast;

use server::state::AppState;
use turnstile_core::{
    alerts::TracingAlertSink,
    blacklist::IpBlacklist,
    breaker::CircuitBreaker,
    config::{
        AdminConfig, AppConfig, BlacklistConfig, DatabaseConfig, LimitsConfig as LimitsSection,
        LoggingConfig, ServerConfig, TelemetryConfig, UpstreamConfig,
    },
    dispatch::{DispatchConfig, Dispatcher},
    limiter::{LimitsConfig, RateLimiter},
    rejects::RejectLog,
    store::{CounterStore, EffectiveCount, StoreError, StoreFeatures},
    telemetry::{Aggregator, IpStats},
};

/// In-memory [`CounterStore`] with injectable readings and failures.
#[derive(Default)]
pub struct MockCounterStore {
    pub flushed: Mutex<Vec<AHashMap<String, IpStats>>>,
    pub origin_hourly: Mutex<Vec<(String, EffectiveCount)>>,
    pub ip_hourly: Mutex<Vec<(String, EffectiveCount)>>,
    pub origin_daily: Mutex<Vec<(String, i64)>>,
    pub ip_daily: Mutex<Vec<(String, i64)>>,
    pub fail_reads: Mutex<bool>,
}

#[async_trait]
impl CounterStore for MockCounterStore {
    async fn features(&self) -> Result<StoreFeatures, StoreError> {
        Ok(StoreFeatures {
            sliding_window: true,
            daily_limits: true,
            hourly_origin_map: true,
            add_merge_fn: true,
        })
    }

    async fn flush_counts(&self, counts: &AHashMap<String, IpStats>) -> Result<(), StoreError> {
        self.flushed.lock().push(counts.clone());
        Ok(())
    }

    async fn origin_hourly_counts(
        &self,
        _previous_hour_weight: f64,
    ) -> Result<Vec<(String, EffectiveCount)>, StoreError> {
        if *self.fail_reads.lock() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(self.origin_hourly.lock().clone())
    }

    async fn ip_hourly_counts(
        &self,
        _previous_hour_weight: f64,
    ) -> Result<Vec<(String, EffectiveCount)>, StoreError> {
        if *self.fail_reads.lock() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(self.ip_hourly.lock().clone())
    }

    async fn origin_daily_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        if *self.fail_reads.lock() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(self.origin_daily.lock().clone())
    }

    async fn ip_daily_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        if *self.fail_reads.lock() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(self.ip_daily.lock().clone())
    }
}

/// Knobs for [`TestProxy::build`].
pub struct TestProxyOptions {
    pub primary_url: String,
    pub fallback_url: Option<String>,
    pub failure_threshold: u32,
    pub admin_key: Option<String>,
    pub blacklist_path: Option<PathBuf>,
    pub limits: LimitsConfig,
}

impl Default for TestProxyOptions {
    fn default() -> Self {
        Self {
            primary_url: "http://127.0.0.1:1".to_string(),
            fallback_url: None,
            failure_threshold: 2,
            admin_key: None,
            blacklist_path: None,
            limits: LimitsConfig {
                origin_hourly: 1000,
                ip_hourly: 1000,
                origin_daily: 10_000,
                ip_daily: 10_000,
            },
        }
    }
}

/// A fully wired proxy router over mock collaborators.
pub struct TestProxy {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MockCounterStore>,
    pub breaker: Arc<CircuitBreaker>,
    /// Keeps the reject-log temp dir alive for the proxy's lifetime.
    _reject_dir: tempfile::TempDir,
    /// Keeps the background shutdown channel open.
    _shutdown_tx: broadcast::Sender<()>,
}

impl TestProxy {
    /// Assembles router + state the way `server::main` does, minus TLS and
    /// the background loops (tests drive polling and flushing explicitly).
    pub fn build(options: TestProxyOptions) -> Self {
        let store = Arc::new(MockCounterStore::default());

        let breaker = Arc::new(CircuitBreaker::new(
            options.failure_threshold,
            Duration::from_secs(60),
            options.fallback_url.is_some(),
            Arc::new(TracingAlertSink),
        ));

        let dispatcher = Arc::new(
            Dispatcher::new(
                DispatchConfig {
                    primary_url: options.primary_url.clone(),
                    fallback_url: options.fallback_url.clone(),
                    request_timeout: Duration::from_secs(2),
                    fallback_timeout: Duration::from_secs(3),
                    insecure_fallback_tls: false,
                },
                Arc::clone(&breaker),
            )
            .expect("dispatcher build"),
        );

        let limiter = Arc::new(RateLimiter::new(
            options.limits,
            Arc::clone(&store) as Arc<dyn CounterStore>,
            Duration::from_secs(60),
        ));

        let aggregator = Arc::new(Aggregator::new([]));
        let blacklist = Arc::new(IpBlacklist::new(options.blacklist_path.clone()));

        let reject_dir = tempfile::tempdir().expect("tempdir");
        let (shutdown_tx, _) = broadcast::channel(1);
        let rejects =
            RejectLog::new(reject_dir.path().join("rejects.log"), shutdown_tx.subscribe());

        let config = Arc::new(AppConfig {
            server: ServerConfig {
                bind_address: "127.0.0.1".into(),
                bind_port: 0,
                tls_cert_path: "unused".into(),
                tls_key_path: "unused".into(),
                max_concurrent_requests: 64,
                body_limit_bytes: 2 * 1024 * 1024,
            },
            upstream: UpstreamConfig {
                primary_url: options.primary_url,
                fallback_url: options.fallback_url,
                request_timeout_seconds: 2,
                fallback_timeout_seconds: 3,
                failure_threshold: options.failure_threshold,
                reset_timeout_seconds: 60,
                insecure_fallback_tls: false,
            },
            limits: LimitsSection {
                origin_hourly: 1000,
                ip_hourly: 1000,
                origin_daily: 10_000,
                ip_daily: 10_000,
                poll_interval_seconds: 60,
            },
            telemetry: TelemetryConfig {
                flush_interval_seconds: 60,
                synthetic_origins: vec![],
                reject_log_path: reject_dir
                    .path()
                    .join("rejects.log")
                    .display()
                    .to_string(),
            },
            database: DatabaseConfig { url: "unused".into(), max_connections: 1 },
            admin: AdminConfig { api_key: options.admin_key },
            blacklist: BlacklistConfig {
                file_path: options.blacklist_path.map(|p| p.display().to_string()),
            },
            logging: LoggingConfig { format: "pretty".into() },
        });

        let state = AppState {
            config,
            dispatcher,
            breaker: Arc::clone(&breaker),
            limiter,
            blacklist,
            aggregator,
            rejects,
            started_at: std::time::Instant::now(),
        };

        let router = server::router::build(state.clone());
        Self {
            router,
            state,
            store,
            breaker,
            _reject_dir: reject_dir,
            _shutdown_tx: shutdown_tx,
        }
    }
}

/// Builds a POST / request carrying a JSON-RPC body and the peer address
/// extension the router's `ConnectInfo` extractor needs.
#[must_use]
pub fn rpc_request(body: &str, headers: &[(&str, &str)]) -> axum::http::Request<axum::body::Body> {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(axum::body::Body::from(body.to_string())).unwrap();
    request.extensions_mut().insert(axum::extract::ConnectInfo(std::net::SocketAddr::from((
        [198, 51, 100, 7],
        41000,
    ))));
    request
}

/// Reads a response body as JSON.
pub async fn body_json(response: axum::http::Response<axum::body::Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
