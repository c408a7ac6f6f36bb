//! Backend selection and fail-open coordination.
//!
//! The policy decides once at startup which backend answers checks and
//! degrades from the distributed store to the in-process limiter the first
//! time the store fails. A check never surfaces an error: if even the
//! fallback fails, the request is allowed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use super::backend::{LimitSettings, RateLimitResult, RateLimiterBackend};
use super::clock::Clock;
use super::distributed::{DistributedRateLimiter, StoreOptions};
use super::limiter::LocalRateLimiter;
use super::window::parse_window;
use crate::config::RateLimitingConfig;
use crate::error::RateKeeperError;

/// Which backend currently answers checks.
pub enum PolicyState {
    /// Every check is allowed with the neutral result
    Disabled,
    /// Checks go to the shared store
    Distributed(Arc<dyn RateLimiterBackend>),
    /// Checks go to the in-process limiter
    Fallback(Arc<dyn RateLimiterBackend>),
}

impl fmt::Debug for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyState::Disabled => f.write_str("Disabled"),
            PolicyState::Distributed(backend) => write!(f, "Distributed({})", backend.name()),
            PolicyState::Fallback(backend) => write!(f, "Fallback({})", backend.name()),
        }
    }
}

/// Data-free view of [`PolicyState`] for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    Disabled,
    Distributed,
    Fallback,
}

/// Backend picked for one check, cloned out so no lock is held across `.await`.
enum Route {
    Distributed(Arc<dyn RateLimiterBackend>),
    Fallback(Arc<dyn RateLimiterBackend>),
}

/// Coordinates the distributed and local limiters.
pub struct RateLimitPolicy {
    state: RwLock<PolicyState>,
    settings: LimitSettings,
    clock: Arc<dyn Clock>,
    distributed_timeout: Duration,
}

impl RateLimitPolicy {
    /// Resolve the initial state from configuration.
    pub fn from_config(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Self {
        let settings = LimitSettings::new(config.max_requests, parse_window(&config.window));
        let distributed_timeout = Duration::from_millis(config.distributed_timeout_ms);

        let state = if config.disabled {
            info!("Rate limiting disabled by config");
            PolicyState::Disabled
        } else if let Some((url, token)) = config.store_credentials() {
            let options = StoreOptions {
                url: url.to_string(),
                token: token.to_string(),
                key_prefix: config.key_prefix.clone(),
                timeout: distributed_timeout,
            };
            match DistributedRateLimiter::new(&options, settings, Arc::clone(&clock)) {
                Ok(limiter) => {
                    info!(
                        limit = settings.max_requests,
                        window_ms = settings.window_ms,
                        "Using distributed rate limiter"
                    );
                    PolicyState::Distributed(Arc::new(limiter))
                }
                Err(e) => {
                    error!(error = %e, "Distributed rate limiter initialization failed, using local fallback");
                    PolicyState::Fallback(Arc::new(LocalRateLimiter::new(settings, Arc::clone(&clock))))
                }
            }
        } else if config.local_fallback {
            info!(
                limit = settings.max_requests,
                window_ms = settings.window_ms,
                "No store credentials, using local rate limiter"
            );
            PolicyState::Fallback(Arc::new(LocalRateLimiter::new(settings, Arc::clone(&clock))))
        } else {
            warn!("Missing store credentials, rate limiting disabled");
            PolicyState::Disabled
        };

        Self {
            state: RwLock::new(state),
            settings,
            clock,
            distributed_timeout,
        }
    }

    /// Build a policy around an explicit initial state.
    pub fn from_state(
        state: PolicyState,
        settings: LimitSettings,
        clock: Arc<dyn Clock>,
        distributed_timeout: Duration,
    ) -> Self {
        Self {
            state: RwLock::new(state),
            settings,
            clock,
            distributed_timeout,
        }
    }

    /// A policy that never limits.
    pub fn disabled() -> Self {
        Self::from_state(
            PolicyState::Disabled,
            LimitSettings::new(0, 0),
            Arc::new(super::clock::SystemClock),
            Duration::ZERO,
        )
    }

    /// Current state without its backend.
    pub fn mode(&self) -> PolicyMode {
        match &*self.state.read() {
            PolicyState::Disabled => PolicyMode::Disabled,
            PolicyState::Distributed(_) => PolicyMode::Distributed,
            PolicyState::Fallback(_) => PolicyMode::Fallback,
        }
    }

    /// Decide whether a request from `identifier` may proceed.
    pub async fn check(&self, identifier: &str) -> RateLimitResult {
        let route = match &*self.state.read() {
            PolicyState::Disabled => return RateLimitResult::neutral(),
            PolicyState::Distributed(backend) => Route::Distributed(Arc::clone(backend)),
            PolicyState::Fallback(backend) => Route::Fallback(Arc::clone(backend)),
        };

        match route {
            Route::Distributed(backend) => match self.check_distributed(backend.as_ref(), identifier).await {
                Ok(result) => result,
                Err(e) => {
                    error!(identifier = %identifier, error = %e, "Distributed rate limit check failed");
                    let fallback = self.enter_fallback();
                    self.check_fallback(fallback.as_ref(), identifier).await
                }
            },
            Route::Fallback(backend) => self.check_fallback(backend.as_ref(), identifier).await,
        }
    }

    /// Stop background work owned by the active backend.
    pub fn shutdown(&self) {
        match &*self.state.read() {
            PolicyState::Disabled => {}
            PolicyState::Distributed(backend) | PolicyState::Fallback(backend) => backend.shutdown(),
        }
    }

    async fn check_distributed(
        &self,
        backend: &dyn RateLimiterBackend,
        identifier: &str,
    ) -> crate::error::Result<RateLimitResult> {
        match tokio::time::timeout(self.distributed_timeout, backend.check(identifier)).await {
            Ok(result) => result,
            Err(_) => Err(RateKeeperError::Timeout(self.distributed_timeout.as_millis() as u64)),
        }
    }

    async fn check_fallback(&self, backend: &dyn RateLimiterBackend, identifier: &str) -> RateLimitResult {
        match backend.check(identifier).await {
            Ok(result) => result,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Fallback rate limit check failed, allowing request");
                RateLimitResult::neutral()
            }
        }
    }

    /// Switch to the local limiter, building it only if no one else has.
    fn enter_fallback(&self) -> Arc<dyn RateLimiterBackend> {
        let mut state = self.state.write();
        if let PolicyState::Fallback(existing) = &*state {
            return Arc::clone(existing);
        }

        warn!(
            limit = self.settings.max_requests,
            window_ms = self.settings.window_ms,
            "Switching to local rate limiter for the rest of this process"
        );
        let fallback: Arc<dyn RateLimiterBackend> =
            Arc::new(LocalRateLimiter::new(self.settings, Arc::clone(&self.clock)));
        *state = PolicyState::Fallback(Arc::clone(&fallback));
        fallback
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("state", &*self.state.read())
            .field("settings", &self.settings)
            .field("distributed_timeout", &self.distributed_timeout)
            .finish()
    }
}
