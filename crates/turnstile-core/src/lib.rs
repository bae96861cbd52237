//! # Turnstile Core
//!
//! Core library for the Turnstile TLS-terminating, metering JSON-RPC proxy.
//!
//! This crate provides the request-plane engine:
//!
//! - **[`client`]**: client IP and origin extraction from untrusted headers,
//!   with the Public / LocalLike origin classification that routes requests
//!   between the rate-limit tiers.
//!
//! - **[`rpc`]**: edge validation of JSON-RPC 2.0 bodies (singletons and
//!   batches) and the blocked-namespace filter.
//!
//! - **[`blacklist`]**: file-backed, hot-reloaded IP deny list.
//!
//! - **[`limiter`]**: sliding-window rate limiter refreshed from the counter
//!   store by a background poll loop.
//!
//! - **[`breaker`]** / **[`dispatch`]**: circuit-breaker-gated dual-upstream
//!   dispatcher with one immediate fallback retry.
//!
//! - **[`telemetry`]**: per-origin and per-IP accounting with an
//!   asynchronous flush loop.
//!
//! - **[`store`]**: Postgres counter store owning the hourly/daily/monthly
//!   reset protocol and the hourly history snapshot.
//!
//! - **[`rejects`]**: buffered, fire-and-forget log of rejected requests.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request (HTTPS)
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ client: IP +    │
//! │ origin extract  │
//! └──────┬──────────┘
//!        ▼
//! ┌─────────────┐   reject   ┌─────────────┐
//! │  rpc:       │ ─────────► │ rejects log │──► 200 + JSON-RPC error
//! │  validate   │            └─────────────┘
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐  blocked
//! │ blacklist + │ ─────────► 200 + JSON-RPC error
//! │ limiter     │
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐            ┌──────────────┐
//! │ dispatch    │ ◄────────► │ breaker      │
//! │ (fwd+retry) │            └──────────────┘
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐   flush    ┌──────────────┐
//! │ telemetry   │ ─────────► │ store (PG)   │ ──► limiter poll
//! └─────────────┘            └──────────────┘
//! ```
//!
//! Fallback-served traffic is never credited to the aggregator; the counter
//! tables only ever bill primary-upstream successes.

pub mod alerts;
pub mod blacklist;
pub mod breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod limiter;
pub mod rejects;
pub mod rpc;
pub mod store;
pub mod telemetry;
pub mod types;
