//! In-process fixed-window rate limiter.
//!
//! This is the fallback backend: it keeps one record per identifier in a
//! sharded concurrent map and is used whenever the distributed store is
//! unavailable or not configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::backend::{LimitSettings, RateLimitResult, RateLimiterBackend};
use super::clock::Clock;
use crate::error::Result;

/// How often expired records are purged.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Request count for one identifier within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateLimitRecord {
    /// Requests seen in this window, at least 1
    count: u32,
    /// Epoch milliseconds at which this window expires
    window_end: u64,
}

/// Records plus the clock they are judged against.
///
/// Shared between the limiter and its sweep task.
struct RecordStore {
    records: DashMap<String, RateLimitRecord>,
    clock: Arc<dyn Clock>,
}

impl RecordStore {
    fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = record.window_end > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

/// Handle to the background sweep task.
struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime, if there is one.
    fn spawn(store: Arc<RecordStore>) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired();
                        debug!(
                            removed = removed,
                            remaining = store.records.len(),
                            "Swept expired rate limit records"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Rate limit sweeper stopping");
                        break;
                    }
                }
            }
        });

        Some(Self { shutdown, handle })
    }

    fn stop(self) {
        // The task may already be gone if the runtime shut down first.
        let _ = self.shutdown.send(true);
        drop(self.handle);
    }
}

/// Fixed-window rate limiter keyed by identifier.
///
/// This struct is thread-safe and can be shared across multiple tasks. The
/// read-check-increment of a single identifier happens under that entry's
/// shard lock, so concurrent requests never count from the same stale value.
pub struct LocalRateLimiter {
    store: Arc<RecordStore>,
    settings: LimitSettings,
    sweeper: Mutex<Option<Sweeper>>,
}

impl LocalRateLimiter {
    /// Create a new limiter.
    ///
    /// When called inside a tokio runtime this also starts the periodic
    /// sweep of expired records; outside a runtime records are only replaced
    /// lazily or by [`Self::sweep_expired`].
    pub fn new(settings: LimitSettings, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(RecordStore {
            records: DashMap::new(),
            clock,
        });
        let sweeper = Sweeper::spawn(Arc::clone(&store));
        if sweeper.is_none() {
            debug!("No tokio runtime available, expired records will not be swept in the background");
        }

        Self {
            store,
            settings,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Count a request for `identifier` and decide whether it may proceed.
    pub fn check(&self, identifier: &str) -> RateLimitResult {
        let now = self.store.clock.now_millis();
        let max_requests = self.settings.max_requests;

        match self.store.records.entry(identifier.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().window_end > now => {
                let record = occupied.get_mut();
                record.count = record.count.saturating_add(1);
                let allowed = record.count <= max_requests;

                trace!(
                    identifier = %identifier,
                    count = record.count,
                    limit = max_requests,
                    "Counted request in open window"
                );
                if !allowed {
                    debug!(identifier = %identifier, count = record.count, "Local rate limit exceeded");
                }

                RateLimitResult {
                    allowed,
                    limit: max_requests,
                    remaining: max_requests.saturating_sub(record.count),
                    reset_at: record.window_end,
                }
            }
            entry => {
                let window_end = now.saturating_add(self.settings.window_ms);
                entry.insert(RateLimitRecord {
                    count: 1,
                    window_end,
                });

                trace!(identifier = %identifier, window_end = window_end, "Opened new window");

                RateLimitResult {
                    allowed: true,
                    limit: max_requests,
                    remaining: max_requests.saturating_sub(1),
                    reset_at: window_end,
                }
            }
        }
    }

    /// Remove every record whose window has ended. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        self.store.sweep_expired()
    }

    /// Get the number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.store.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.records.is_empty()
    }

    /// The limit and window this limiter enforces.
    pub fn settings(&self) -> LimitSettings {
        self.settings
    }

    /// Stop the background sweep. Checks keep working afterwards.
    pub fn stop_sweeper(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }
}

impl Drop for LocalRateLimiter {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[async_trait]
impl RateLimiterBackend for LocalRateLimiter {
    async fn check(&self, identifier: &str) -> Result<RateLimitResult> {
        Ok(LocalRateLimiter::check(self, identifier))
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn shutdown(&self) {
        self.stop_sweeper();
    }
}
