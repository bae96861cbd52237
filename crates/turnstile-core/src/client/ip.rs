//! Client IP extraction and canonicalization.

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

use super::UNKNOWN;

/// Proxy headers consulted for the client address, in trust order.
///
/// CDN-injected headers come first; `X-Forwarded-For` is only trusted for
/// its first (client-most) entry.
const IP_HEADERS: &[&str] =
    &["cf-connecting-ip", "true-client-ip", "x-forwarded-for", "x-real-ip", "fastly-client-ip"];

/// Extracts the canonical client IP for a request.
///
/// Consults the proxy headers in [`IP_HEADERS`] order and falls back to the
/// transport peer address. IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are
/// stripped to their IPv4 form. Returns `"unknown"` when no candidate parses
/// as an IP address; this function never fails the request.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    for name in IP_HEADERS {
        let Some(raw) = headers.get(*name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        // X-Forwarded-For carries a chain; the first entry is the client.
        let candidate = raw.split(',').next().unwrap_or(raw).trim();
        if let Some(ip) = normalize(candidate) {
            return ip;
        }
    }

    if let Some(peer) = peer {
        if let Some(ip) = normalize(&peer.ip().to_string()) {
            return ip;
        }
    }

    UNKNOWN.to_string()
}

/// Parses and canonicalizes a single IP candidate.
///
/// Returns `None` for anything that is not a literal IP address.
#[must_use]
pub fn normalize(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed.strip_prefix("::ffff:").filter(|rest| rest.contains('.')).unwrap_or(trimmed);
    match stripped.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => {
            // Mapped addresses that arrive fully parsed rather than as a
            // `::ffff:` prefix string.
            Some(v6.to_ipv4_mapped().map_or_else(|| v6.to_string(), |v4| v4.to_string()))
        }
        Ok(addr) => Some(addr.to_string()),
        Err(_) => None,
    }
}

/// True for loopback addresses in either family.
///
/// Used by the aggregator to drop local traffic from billing counters.
#[must_use]
pub fn is_loopback(ip: &str) -> bool {
    ip.parse::<IpAddr>().map(|addr| addr.is_loopback()).unwrap_or(false)
}
