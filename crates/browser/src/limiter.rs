//! Per-user in-flight concurrency limiting with bounded FIFO wait.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::sync::oneshot;

use camofox_common::{CoreError, Result};

#[derive(Debug)]
struct Bucket {
    active: usize,
    queue: VecDeque<(u64, oneshot::Sender<()>)>,
    next_waiter: u64,
}

impl Bucket {
    fn new() -> Self {
        Self {
            active: 0,
            queue: VecDeque::new(),
            next_waiter: 0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    buckets: StdMutex<HashMap<String, Bucket>>,
    max_per_user: usize,
    wait_timeout: Duration,
}

/// Bounds in-flight operations per user; excess callers wait FIFO with a
/// hard deadline.
#[derive(Clone)]
pub struct UserLimiter {
    inner: Arc<Inner>,
}

impl UserLimiter {
    pub fn new(max_per_user: usize, wait_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                buckets: StdMutex::new(HashMap::new()),
                max_per_user: max_per_user.max(1),
                wait_timeout,
            }),
        }
    }

    /// Acquire a slot for `user_id`; the permit releases on drop.
    ///
    /// Fails with a retryable error when the FIFO wait exceeds the hard
    /// deadline. Active counts are untouched by a failed wait.
    pub async fn acquire(&self, user_id: &str) -> Result<UserPermit> {
        let waiter = {
            let mut buckets = self.inner.buckets.lock().expect("limiter buckets");
            let bucket = bucket_entry(&mut buckets, user_id);
            if bucket.active < self.inner.max_per_user {
                bucket.active += 1;
                None
            } else {
                let id = bucket.next_waiter;
                bucket.next_waiter += 1;
                let (tx, rx) = oneshot::channel();
                bucket.queue.push_back((id, tx));
                Some((id, rx))
            }
        };

        if let Some((waiter_id, rx)) = waiter {
            match tokio::time::timeout(self.inner.wait_timeout, rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Sender dropped without a grant; bucket was torn down.
                    return Err(CoreError::busy("user concurrency queue was dropped"));
                }
                Err(_) => {
                    let mut buckets = self.inner.buckets.lock().expect("limiter buckets");
                    if let Some(bucket) = buckets.get_mut(user_id) {
                        let before = bucket.queue.len();
                        bucket.queue.retain(|(id, _)| *id != waiter_id);
                        if bucket.queue.len() == before {
                            // Raced with a grant: the slot is ours, give it
                            // back so the next waiter proceeds.
                            release_slot(&mut buckets, user_id);
                        }
                    }
                    return Err(CoreError::busy(format!(
                        "too many concurrent operations for user, gave up after {}s",
                        self.inner.wait_timeout.as_secs()
                    )));
                }
            }
        }

        Ok(UserPermit {
            inner: Arc::clone(&self.inner),
            user_id: user_id.to_string(),
        })
    }

    /// Current in-flight count for a user.
    pub fn active(&self, user_id: &str) -> usize {
        self.inner
            .buckets
            .lock()
            .expect("limiter buckets")
            .get(user_id)
            .map(|bucket| bucket.active)
            .unwrap_or(0)
    }
}

fn bucket_entry<'a>(buckets: &'a mut HashMap<String, Bucket>, user_id: &str) -> &'a mut Bucket {
    buckets.entry(user_id.to_string()).or_insert_with(Bucket::new)
}

/// Decrement active, hand the slot to the oldest waiter, and delete the
/// bucket once it is fully idle.
fn release_slot(buckets: &mut HashMap<String, Bucket>, user_id: &str) {
    let Some(bucket) = buckets.get_mut(user_id) else {
        return;
    };
    bucket.active = bucket.active.saturating_sub(1);
    while let Some((_, tx)) = bucket.queue.pop_front() {
        if tx.send(()).is_ok() {
            bucket.active += 1;
            break;
        }
        // Receiver gave up between queueing and the grant; try the next one.
    }
    if bucket.active == 0 && bucket.queue.is_empty() {
        buckets.remove(user_id);
    }
}

/// An acquired per-user slot.
#[derive(Debug)]
pub struct UserPermit {
    inner: Arc<Inner>,
    user_id: String,
}

impl Drop for UserPermit {
    fn drop(&mut self) {
        let mut buckets = self.inner.buckets.lock().expect("limiter buckets");
        release_slot(&mut buckets, &self.user_id);
    }
}
