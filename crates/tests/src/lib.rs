//! Integration tests for the Turnstile proxy.
//!
//! Test modules:
//!
//! - `admission_tests`: validation, namespace filtering, and reject behavior
//!   through the full router
//! - `failover_tests`: dispatcher + breaker behavior against mock upstreams,
//!   including the fallback-is-never-billed rule
//! - `limiter_tests`: rate-limit denials and admission precedence over mock
//!   counter-store data
//! - `admin_tests`: admin surface authentication and snapshots
//! - `mock_infrastructure`: reusable mock upstreams and counter stores
//!
//! Run with `cargo test --package tests`. All tests are hermetic: upstreams
//! are mockito servers and the counter store is an in-memory double.

pub mod mock_infrastructure;

#[cfg(test)]
mod admission_tests;

#[cfg(test)]
mod failover_tests;

#[cfg(test)]
mod limiter_tests;

#[cfg(test)]
mod admin_tests;
