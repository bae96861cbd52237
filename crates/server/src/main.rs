use anyhow::{anyhow, Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use server::{router, state::AppState};
use turnstile_core::{
    alerts::TracingAlertSink,
    blacklist::IpBlacklist,
    breaker::CircuitBreaker,
    config::AppConfig,
    dispatch::{DispatchConfig, Dispatcher},
    limiter::{LimitsConfig, RateLimiter},
    rejects::RejectLog,
    store::PgCounterStore,
    telemetry::{Aggregator, FlushLoop, NoopDemandSink, NoopSettlementHook},
};

/// Initializes the logging system based on the configuration.
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,turnstile_core=info,server=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

/// Builds every core service and wires the background loops.
async fn init_services(
    config: Arc<AppConfig>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(AppState, Arc<FlushLoop>)> {
    let breaker = Arc::new(CircuitBreaker::new(
        config.upstream.failure_threshold,
        Duration::from_secs(config.upstream.reset_timeout_seconds),
        config.upstream.fallback_url.is_some(),
        Arc::new(TracingAlertSink),
    ));

    let dispatcher = Arc::new(
        Dispatcher::new(
            DispatchConfig {
                primary_url: config.upstream.primary_url.clone(),
                fallback_url: config.upstream.fallback_url.clone(),
                request_timeout: Duration::from_secs(config.upstream.request_timeout_seconds),
                fallback_timeout: Duration::from_secs(config.upstream.fallback_timeout_seconds),
                insecure_fallback_tls: config.upstream.insecure_fallback_tls,
            },
            Arc::clone(&breaker),
        )
        .context("dispatcher initialization failed")?,
    );

    let store = Arc::new(
        PgCounterStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("counter store connection failed")?,
    );

    let limiter = Arc::new(RateLimiter::new(
        LimitsConfig {
            origin_hourly: config.limits.origin_hourly,
            ip_hourly: config.limits.ip_hourly,
            origin_daily: config.limits.origin_daily,
            ip_daily: config.limits.ip_daily,
        },
        Arc::clone(&store) as Arc<dyn turnstile_core::store::CounterStore>,
        Duration::from_secs(config.limits.poll_interval_seconds),
    ));
    Arc::clone(&limiter).spawn_poller(shutdown_tx.subscribe());

    let aggregator = Arc::new(Aggregator::new(config.telemetry.synthetic_origins.clone()));
    let flush = Arc::new(FlushLoop::new(
        Arc::clone(&aggregator),
        store,
        Arc::new(NoopDemandSink),
        Arc::new(NoopSettlementHook),
        Duration::from_secs(config.telemetry.flush_interval_seconds),
    ));
    Arc::clone(&flush).spawn(shutdown_tx.subscribe());

    let blacklist =
        Arc::new(IpBlacklist::new(config.blacklist.file_path.clone().map(PathBuf::from)));
    Arc::clone(&blacklist).spawn_watcher(shutdown_tx.subscribe());
    info!(entries = blacklist.len(), "blacklist loaded");

    let rejects = RejectLog::new(
        PathBuf::from(&config.telemetry.reject_log_path),
        shutdown_tx.subscribe(),
    );

    let state = AppState {
        config,
        dispatcher,
        breaker,
        limiter,
        blacklist,
        aggregator,
        rejects,
        started_at: std::time::Instant::now(),
    };
    Ok((state, flush))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(AppConfig::load().context("configuration load failed")?);
    init_logging(&config);

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let (shutdown_tx, _) = broadcast::channel(8);
    let (state, _flush) = init_services(Arc::clone(&config), &shutdown_tx).await?;

    // TLS material is a hard startup requirement.
    let tls = RustlsConfig::from_pem_file(
        &config.server.tls_cert_path,
        &config.server.tls_key_path,
    )
    .await
    .with_context(|| {
        format!(
            "failed to read TLS material ({} / {})",
            config.server.tls_cert_path, config.server.tls_key_path
        )
    })?;

    let addr = config.socket_addr().map_err(|e| anyhow!(e))?;
    let app = router::build(state);

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received; draining");
            let _ = shutdown_tx.send(());
            handle.graceful_shutdown(Some(Duration::from_secs(30)));
        });
    }

    info!(%addr, "turnstile listening");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    // Give the background loops a beat to run their shutdown flushes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("turnstile stopped");
    Ok(())
}
