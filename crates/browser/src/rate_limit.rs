//! Per-user fixed-window rate limiting.

use std::{sync::Arc, time::Duration};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    tracing::debug,
};

use camofox_common::now_millis;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct WindowEntry {
    count: u32,
    reset_at: u64,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

/// In-process fixed-window counter, one bucket per user.
pub struct RateLimiter {
    buckets: DashMap<String, WindowEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Count a request against `user_id`'s window.
    pub fn check(&self, user_id: &str, max: u32, window: Duration) -> RateDecision {
        let now = now_millis();
        let window_ms = window.as_millis() as u64;

        match self.buckets.entry(user_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(WindowEntry {
                    count: 1,
                    reset_at: now + window_ms,
                });
                RateDecision::allow()
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.reset_at <= now {
                    *entry = WindowEntry {
                        count: 1,
                        reset_at: now + window_ms,
                    };
                    RateDecision::allow()
                } else if entry.count < max {
                    entry.count += 1;
                    RateDecision::allow()
                } else {
                    RateDecision::deny(Duration::from_millis(entry.reset_at - now))
                }
            }
        }
    }

    /// Drop expired windows.
    pub fn sweep(&self) {
        let now = now_millis();
        let before = self.buckets.len();
        self.buckets.retain(|_, entry| entry.reset_at > now);
        let dropped = before.saturating_sub(self.buckets.len());
        if dropped > 0 {
            debug!(dropped, "swept expired rate-limit windows");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
