//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured maximum requests per window
    pub limit: u32,
    /// Requests left in the current window after this one, never negative
    pub remaining: u32,
    /// Epoch milliseconds at which the current window ends
    pub reset_at: u64,
}

impl RateLimitResult {
    /// The "no limiting happened" answer: allowed, with every counter at zero.
    pub const fn neutral() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_at: 0,
        }
    }
}

/// Limit and window shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSettings {
    /// Maximum requests allowed per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl LimitSettings {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }
}

/// Trait for rate limiter implementations.
///
/// Both the in-process `LocalRateLimiter` and the `DistributedRateLimiter`
/// implement this so the policy can switch between them at runtime.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request for `identifier` and decide whether it may proceed.
    async fn check(&self, identifier: &str) -> Result<RateLimitResult>;

    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Stop any background work owned by the backend.
    fn shutdown(&self) {}
}
