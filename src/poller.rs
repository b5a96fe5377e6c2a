// =============================================================================
// FallbackPoller — periodic re-fetch when the stream is not usable
// =============================================================================
//
// A start/stop timer abstraction driven purely by session lifecycle. The first
// tick fires immediately, then every `interval_ms`. At most one timer runs per
// poller: `start` on a running poller replaces the prior timer. A failed tick
// is logged and dropped; the schedule continues.
// =============================================================================

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::FeedError;

/// Default poll cadence in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;

pub struct FallbackPoller {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackPoller {
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    /// Begin calling `tick` immediately and then every `interval_ms` until
    /// `stop`. Replaces any timer already running (no overlap, no leak).
    pub fn start<F, Fut>(&self, interval_ms: u64, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FeedError>> + Send + 'static,
    {
        self.stop();

        let task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
            // A stalled tick must not cause a burst of catch-up ticks.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = tick().await {
                    // Degrade gracefully: drop this tick, keep the schedule.
                    warn!(error = %e, "poll tick failed");
                }
            }
        });

        *self.handle.lock() = Some(task);
        info!(interval_ms, "fallback poller started");
    }

    /// Cancel the timer synchronously. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(task) = self.handle.lock().take() {
            task.abort();
            debug!("fallback poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

impl Default for FallbackPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
