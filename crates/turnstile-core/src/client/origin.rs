//! Origin extraction and Public / LocalLike classification.
//!
//! The classification decides which rate-limit tier a request lands in:
//! requests with a public web origin are limited per origin, everything else
//! is limited per client IP. The test is deliberately strict; anything that
//! is not a syntactically valid public domain is treated as "no origin".

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr};

use super::UNKNOWN;

/// How an origin participates in rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginClass {
    /// A syntactically valid public domain; limited per origin.
    Public,
    /// Local, private, malformed, or absent; limited per client IP.
    LocalLike,
}

/// Hostname suffixes reserved for non-public networks.
const LOCAL_SUFFIXES: &[&str] = &[".local", ".internal", ".lan", ".home", ".localhost"];

/// Browser-extension and file schemes that can never be public origins.
const NON_WEB_SCHEMES: &[&str] =
    &["chrome-extension://", "moz-extension://", "safari-web-extension://", "ms-browser-extension://", "file://"];

/// Returns the `Origin` header verbatim, or `"unknown"` when absent or
/// unreadable.
#[must_use]
pub fn extract_origin(headers: &HeaderMap) -> String {
    headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| UNKNOWN.to_string(), str::to_string)
}

/// Strips the scheme and any trailing slash from an origin value and lowers
/// its case.
///
/// Counter tables and blocklists key origins by bare host, so
/// `https://Example.com/` and `example.com` must collapse to the same key.
#[must_use]
pub fn clean_origin(origin: &str) -> String {
    let trimmed = origin.trim();
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    without_scheme.trim_end_matches('/').to_ascii_lowercase()
}

/// Classifies an origin as Public or LocalLike.
///
/// LocalLike covers: empty/absent origins, `localhost` (with or without a
/// subdomain-style suffix), RFC1918 and loopback addresses, hosts carrying a
/// port, reserved local suffixes, extension and `file://` schemes, and
/// anything that fails DNS-label structural validation.
#[must_use]
pub fn classify(origin: &str) -> OriginClass {
    let trimmed = origin.trim();
    if trimmed.is_empty() || trimmed == UNKNOWN {
        return OriginClass::LocalLike;
    }

    let lower = trimmed.to_ascii_lowercase();
    if NON_WEB_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
        return OriginClass::LocalLike;
    }

    let host = clean_origin(&lower);
    if host.is_empty() {
        return OriginClass::LocalLike;
    }

    // Any colon left after scheme stripping is a port (or an IPv6 literal,
    // which is not a public domain either way).
    if host.contains(':') {
        return OriginClass::LocalLike;
    }

    if host == "localhost" || host.starts_with("localhost.") {
        return OriginClass::LocalLike;
    }

    if LOCAL_SUFFIXES.iter().any(|suffix| host.ends_with(suffix)) {
        return OriginClass::LocalLike;
    }

    if let Ok(addr) = host.parse::<IpAddr>() {
        return match addr {
            IpAddr::V4(v4) if is_private_v4(v4) || v4.is_loopback() => OriginClass::LocalLike,
            IpAddr::V6(v6) if v6.is_loopback() => OriginClass::LocalLike,
            // Public IP literals still fail the domain test below, but make
            // the intent explicit here.
            _ => OriginClass::LocalLike,
        };
    }

    if is_valid_public_domain(&host) {
        OriginClass::Public
    } else {
        OriginClass::LocalLike
    }
}

/// RFC1918 private IPv4 ranges.
fn is_private_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 10 ||
        (octets[0] == 172 && (16..=31).contains(&octets[1])) ||
        (octets[0] == 192 && octets[1] == 168)
}

/// Structural DNS validation: at least two labels, each label 1-63 chars of
/// letters, digits, and interior hyphens; the TLD purely alphabetic and at
/// least two characters.
fn is_valid_public_domain(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
    }

    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}
