//! Turnstile - Distributed Admission Control for API Gateways
//!
//! This crate decides, per incoming request, whether the request may proceed
//! based on how many requests the same client made recently (rate limiting)
//! and how many of its requests are still in flight (concurrency limiting).
//! All counters live in a shared Redis-compatible store so that any number of
//! gateway processes enforce one limit per client.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;
