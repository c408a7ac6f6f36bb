//! Error types for the Ratekeeper service.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
///
/// None of these ever reach a caller of `RateLimitPolicy::check`; they are
/// raised by backends and configuration loading and handled by the policy or
/// by `main`.
#[derive(Error, Debug)]
pub enum RateKeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A backend could not be constructed
    #[error("Backend error: {0}")]
    Backend(String),

    /// The distributed store answered with an error
    #[error("Store error (status {status}): {message}")]
    Store { status: u16, message: String },

    /// Transport failure while talking to the distributed store
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A backend did not answer in time
    #[error("Backend timed out after {0} ms")]
    Timeout(u64),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(#[from] hyper::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateKeeperError>;
