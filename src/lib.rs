//! Ratekeeper - Per-client Rate Limiting Service
//!
//! This crate decides whether a request identified by a key (usually the
//! client IP) may proceed. Counting is delegated to a distributed store when
//! one is configured and degrades to an in-process fixed-window limiter when
//! the store is unavailable. Internal faults never deny traffic.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
