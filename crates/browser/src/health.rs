//! Navigation health tracking.

use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::warn;

/// How long without a successful navigation (while idle) before the probe
/// starts warning.
const STALE_NAV_AGE: Duration = Duration::from_secs(120);

/// Tracks consecutive navigation failures and the in-flight op gauge.
///
/// Only navigations feed the failure counter; a single success resets it.
pub struct HealthTracker {
    consecutive_nav_failures: AtomicU32,
    last_successful_nav: StdMutex<Instant>,
    recovering: AtomicBool,
    active_ops: AtomicU64,
    failure_threshold: u32,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            consecutive_nav_failures: AtomicU32::new(0),
            last_successful_nav: StdMutex::new(Instant::now()),
            recovering: AtomicBool::new(false),
            active_ops: AtomicU64::new(0),
            failure_threshold,
        }
    }

    pub fn record_nav_success(&self) {
        self.consecutive_nav_failures.store(0, Ordering::SeqCst);
        *self.last_successful_nav.lock().expect("health lock") = Instant::now();
    }

    /// Returns `true` iff the failure streak has reached the threshold.
    pub fn record_nav_failure(&self) -> bool {
        let failures = self.consecutive_nav_failures.fetch_add(1, Ordering::SeqCst) + 1;
        failures >= self.failure_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_nav_failures.load(Ordering::SeqCst)
    }

    /// Increment the in-flight gauge; the guard decrements on drop.
    pub fn begin_op(self: &Arc<Self>) -> OpGuard {
        self.active_ops.fetch_add(1, Ordering::SeqCst);
        OpGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active_ops(&self) -> u64 {
        self.active_ops.load(Ordering::SeqCst)
    }

    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::SeqCst);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// One probe tick: warn when the plane is idle but navigation has been
    /// failing or absent for a while.
    pub fn probe(&self) {
        if self.active_ops() != 0 {
            return;
        }
        let age = self.last_successful_nav.lock().expect("health lock").elapsed();
        if age > STALE_NAV_AGE {
            warn!(
                seconds_since_success = age.as_secs(),
                consecutive_failures = self.consecutive_failures(),
                "no successful navigation recently"
            );
        }
    }

    pub fn spawn_probe(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.probe();
            }
        })
    }
}

/// Decrements the active-op gauge when dropped, on every exit path.
pub struct OpGuard {
    tracker: Arc<HealthTracker>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.tracker.active_ops.fetch_sub(1, Ordering::SeqCst);
    }
}
