//! Rate limiting logic and backend selection.

mod backend;
mod clock;
mod distributed;
mod limiter;
mod policy;
mod window;

pub use backend::{LimitSettings, RateLimitResult, RateLimiterBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedRateLimiter, StoreOptions};
pub use limiter::{LocalRateLimiter, SWEEP_INTERVAL};
pub use policy::{PolicyMode, PolicyState, RateLimitPolicy};
pub use window::{parse_window, window_duration, DEFAULT_WINDOW_MS};
