//! Tollgate - Per-Identity Admission Control
//!
//! This crate implements an HTTP admission layer that limits each caller to a
//! fixed number of requests per window. Callers are identified by an access
//! token header or, failing that, by source address. Counters live in a shared
//! Redis store so every instance enforces the same quota, and a caller that
//! exceeds its limit is blocked for a configurable period.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
