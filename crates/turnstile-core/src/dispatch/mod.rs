//! Upstream dispatch: forwarding, failover, and outcome reporting.
//!
//! The dispatcher owns the HTTP clients (built once at startup, reused for
//! every request) and the retry policy: one immediate attempt via the
//! fallback upstream when the primary fails. It reports POST outcomes to the
//! circuit breaker and tells the caller whether the fallback served the
//! request, because fallback traffic is never billed.

use axum::http::HeaderMap;
use bytes::Bytes;
use reqwest::{Client, ClientBuilder};
use std::{sync::Arc, time::Duration};

use crate::breaker::{CircuitBreaker, Route};

/// Headers never forwarded to the primary upstream.
///
/// Hop-by-hop and transport-level headers; reqwest recomputes these.
const HOP_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding", "accept-encoding"];

/// Dispatcher construction error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Upstream endpoints and timeout policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub primary_url: String,
    pub fallback_url: Option<String>,
    /// Bound on the primary POST path.
    pub request_timeout: Duration,
    /// Bound on the fallback path; includes buffer over `request_timeout`.
    pub fallback_timeout: Duration,
    /// Accept self-signed certificates on the fallback upstream.
    pub insecure_fallback_tls: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            primary_url: String::new(),
            fallback_url: None,
            request_timeout: Duration::from_secs(10),
            fallback_timeout: Duration::from_secs(15),
            insecure_fallback_tls: false,
        }
    }
}

/// What the proxy returns to the client for one forwarded call.
#[derive(Debug, Clone)]
pub struct ForwardOutcome {
    pub status: u16,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// True when the fallback upstream produced this response, either in
    /// breaker-directed fallback mode or via the immediate retry.
    pub used_fallback: bool,
    /// True when an upstream answered with a success status. Gates
    /// aggregator credit together with `used_fallback`.
    pub upstream_ok: bool,
}

impl ForwardOutcome {
    fn failure(status: u16, message: String, used_fallback: bool) -> Self {
        Self {
            status,
            body: Bytes::from(message),
            content_type: Some("text/plain; charset=utf-8".to_string()),
            used_fallback,
            upstream_ok: false,
        }
    }
}

/// Forwards validated traffic to the selected upstream.
pub struct Dispatcher {
    primary_client: Client,
    fallback_client: Client,
    config: DispatchConfig,
    breaker: Arc<CircuitBreaker>,
}

impl Dispatcher {
    /// Builds the dispatcher and both HTTP clients.
    ///
    /// The fallback client is separate so its TLS posture can tolerate a
    /// self-signed secondary without weakening the primary connection.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ClientBuild`] if a reqwest client cannot be
    /// constructed.
    pub fn new(config: DispatchConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, DispatchError> {
        let primary_client = base_client_builder()
            .build()
            .map_err(|e| DispatchError::ClientBuild(e.to_string()))?;

        let mut fallback_builder = base_client_builder();
        if config.insecure_fallback_tls {
            fallback_builder = fallback_builder.danger_accept_invalid_certs(true);
        }
        let fallback_client =
            fallback_builder.build().map_err(|e| DispatchError::ClientBuild(e.to_string()))?;

        Ok(Self { primary_client, fallback_client, config, breaker })
    }

    /// Forwards a POST body upstream.
    ///
    /// Never returns an error: transport failures collapse into a 5xx (or
    /// the upstream's own status when one was observed) inside the outcome.
    pub async fn forward(&self, headers: &HeaderMap, body: Bytes) -> ForwardOutcome {
        let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string);

        if self.breaker.route().await == Route::Fallback {
            // Breaker-directed fallback mode: the outcome does not feed the
            // breaker, whose statistics describe the primary.
            return match self.send_fallback(&user_agent, body).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(error = %err, "fallback upstream failed in fallback mode");
                    ForwardOutcome::failure(502, err.to_string(), true)
                }
            };
        }

        match self.send_primary(headers, body.clone()).await {
            Ok(outcome) => {
                self.breaker.on_success().await;
                outcome
            }
            Err(primary_err) => {
                self.breaker.on_failure().await;
                tracing::warn!(error = %primary_err.message, "primary upstream failed; retrying via fallback");

                match self.send_fallback(&user_agent, body).await {
                    Ok(mut outcome) => {
                        outcome.used_fallback = true;
                        outcome
                    }
                    Err(fallback_err) => {
                        let status = primary_err.status.unwrap_or(500);
                        let message = format!(
                            "primary upstream error: {}; fallback retry: {}",
                            primary_err.message, fallback_err
                        );
                        ForwardOutcome::failure(status, message, true)
                    }
                }
            }
        }
    }

    /// Diagnostic GET probe: primary first, fallback on transport failure.
    /// Neither outcome feeds the breaker.
    pub async fn probe_get(&self) -> ForwardOutcome {
        match self.get(&self.primary_client, &self.config.primary_url).await {
            Ok(outcome) => outcome,
            Err(primary_err) => {
                let Some(fallback_url) = &self.config.fallback_url else {
                    return ForwardOutcome::failure(502, primary_err, false);
                };
                match self.get(&self.fallback_client, fallback_url).await {
                    Ok(mut outcome) => {
                        outcome.used_fallback = true;
                        outcome
                    }
                    Err(fallback_err) => ForwardOutcome::failure(
                        502,
                        format!("primary: {primary_err}; fallback: {fallback_err}"),
                        true,
                    ),
                }
            }
        }
    }

    /// POST to the primary with the client's headers plus forced
    /// `Content-Type: application/json`.
    async fn send_primary(
        &self,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ForwardOutcome, PrimaryError> {
        let mut request = self
            .primary_client
            .post(&self.config.primary_url)
            .timeout(self.config.request_timeout)
            .body(body);

        for (name, value) in headers {
            let lowered = name.as_str().to_ascii_lowercase();
            if HOP_HEADERS.contains(&lowered.as_str()) || lowered == "content-type" {
                continue;
            }
            if let Ok(v) = value.to_str() {
                request = request.header(name.as_str(), v);
            }
        }
        request = request.header("content-type", "application/json");

        let response = request.send().await.map_err(|e| PrimaryError {
            status: None,
            message: sanitize_network_error(&e),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PrimaryError {
                status: Some(status.as_u16()),
                message: format!("primary returned status {status}"),
            });
        }

        let content_type = header_string(response.headers(), "content-type");
        let bytes = response.bytes().await.map_err(|e| PrimaryError {
            status: None,
            message: sanitize_network_error(&e),
        })?;

        Ok(ForwardOutcome {
            status: status.as_u16(),
            body: bytes,
            content_type,
            used_fallback: false,
            upstream_ok: true,
        })
    }

    /// POST to the fallback with a sanitized header set: JSON content type
    /// and the client's user agent, nothing else.
    async fn send_fallback(
        &self,
        user_agent: &Option<String>,
        body: Bytes,
    ) -> Result<ForwardOutcome, String> {
        let fallback_url =
            self.config.fallback_url.as_ref().ok_or_else(|| "no fallback upstream configured".to_string())?;

        let mut request = self
            .fallback_client
            .post(fallback_url)
            .timeout(self.config.fallback_timeout)
            .header("content-type", "application/json")
            .body(body);
        if let Some(ua) = user_agent {
            request = request.header("user-agent", ua);
        }

        let response = request.send().await.map_err(|e| sanitize_network_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("fallback returned status {status}"));
        }

        let content_type = header_string(response.headers(), "content-type");
        let bytes = response.bytes().await.map_err(|e| sanitize_network_error(&e))?;

        Ok(ForwardOutcome {
            status: status.as_u16(),
            body: bytes,
            content_type,
            used_fallback: true,
            upstream_ok: true,
        })
    }

    async fn get(&self, client: &Client, url: &str) -> Result<ForwardOutcome, String> {
        let response = client
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| sanitize_network_error(&e))?;

        let status = response.status().as_u16();
        let content_type = header_string(response.headers(), "content-type");
        let bytes = response.bytes().await.map_err(|e| sanitize_network_error(&e))?;

        Ok(ForwardOutcome {
            status,
            body: bytes,
            content_type,
            used_fallback: false,
            upstream_ok: true,
        })
    }
}

/// Primary-path failure carrying the upstream status when one was observed,
/// so a final failure can surface it instead of a generic 500.
struct PrimaryError {
    status: Option<u16>,
    message: String,
}

fn base_client_builder() -> ClientBuilder {
    ClientBuilder::new()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(64)
        .connect_timeout(Duration::from_secs(5))
        .use_rustls_tls()
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
}

fn header_string(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Collapses network errors into coarse categories to keep upstream
/// addresses and credentials out of client-visible messages.
fn sanitize_network_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "upstream timed out".to_string()
    } else if error.is_connect() {
        "upstream unreachable".to_string()
    } else if error.is_body() || error.is_decode() {
        "upstream response unreadable".to_string()
    } else {
        "upstream request failed".to_string()
    }
}
