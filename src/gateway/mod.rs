//! HTTP surface of the rate limiter.

mod identifier;
mod server;
mod service;

pub use identifier::{client_identifier, ANONYMOUS};
pub use server::HttpServer;
pub use service::{
    attach_rate_limit_headers, RateLimitService, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
