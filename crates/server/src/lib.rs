//! Turnstile server library: router assembly, admin surface, shared state.
//!
//! Kept as a library so integration tests can assemble the router against
//! mock collaborators without binding a TLS listener.

pub mod admin;
pub mod router;
pub mod state;
