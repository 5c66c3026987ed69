//! Mutually-authenticated server harness
//!
//! Wraps an axum router in a rustls listener that requires verified client
//! certificates, serves a health-check protocol next to the business
//! services, and drains gracefully on SIGTERM/SIGINT or cancellation.

pub mod config;
pub mod poller;
pub mod server;
