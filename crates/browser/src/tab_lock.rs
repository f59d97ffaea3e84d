//! Strict per-tab serialization.
//!
//! Each tab has at most one stored "tail" future. A new operation chains
//! behind the current tail, installs itself as the new tail, and on
//! completion clears the slot only if it is still the tail — a newer op may
//! have taken over in the meantime.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use {
    futures::{FutureExt, future::Shared},
    tokio::sync::oneshot,
};

use camofox_common::{CoreError, Result};

type TailFuture = Shared<futures::future::BoxFuture<'static, ()>>;

struct Slot {
    generation: u64,
    tail: TailFuture,
}

/// Per-tab operation locks.
pub struct TabLocks {
    slots: Arc<StdMutex<HashMap<String, Slot>>>,
    next_generation: StdMutex<u64>,
    acquire_timeout: Duration,
}

impl TabLocks {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(StdMutex::new(HashMap::new())),
            next_generation: StdMutex::new(0),
            acquire_timeout,
        }
    }

    /// Run `op` with exclusive access to `tab_id`.
    ///
    /// Waiting for the current holder is bounded by the acquisition timeout;
    /// on expiry the op fails without running, and successors chained behind
    /// us are unblocked.
    pub async fn with_lock<T, F>(&self, tab_id: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let my_tail: TailFuture = done_rx.map(|_| ()).boxed().shared();

        let (generation, prior) = {
            let mut generations = self.next_generation.lock().expect("tab lock generations");
            *generations += 1;
            let generation = *generations;
            drop(generations);

            let mut slots = self.slots.lock().expect("tab lock slots");
            let prior = slots.get(tab_id).map(|slot| slot.tail.clone());
            slots.insert(
                tab_id.to_string(),
                Slot {
                    generation,
                    tail: my_tail,
                },
            );
            (generation, prior)
        };

        if let Some(prior) = prior
            && tokio::time::timeout(self.acquire_timeout, prior.clone())
                .await
                .is_err()
        {
            // We never got the lock, but successors already chain through our
            // tail: keep the chain intact by completing it only once the
            // current holder actually finishes.
            let slots = Arc::clone(&self.slots);
            let tab_id = tab_id.to_string();
            tokio::spawn(async move {
                prior.await;
                let _ = done_tx.send(());
                let mut slots = slots.lock().expect("tab lock slots");
                if let Some(slot) = slots.get(&tab_id)
                    && slot.generation == generation
                {
                    slots.remove(&tab_id);
                }
            });
            return Err(CoreError::timeout(
                "timed out waiting for tab lock".to_string(),
            ));
        }

        let result = op.await;

        let _ = done_tx.send(());
        self.clear_if_generation(tab_id, generation);
        result
    }

    /// Remove the slot unconditionally; called when a tab is closed so an
    /// in-flight op leaves no residue.
    pub fn clear(&self, tab_id: &str) {
        self.slots.lock().expect("tab lock slots").remove(tab_id);
    }

    fn clear_if_generation(&self, tab_id: &str, generation: u64) {
        let mut slots = self.slots.lock().expect("tab lock slots");
        if let Some(slot) = slots.get(tab_id)
            && slot.generation == generation
        {
            slots.remove(tab_id);
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn serializes_concurrent_ops_in_submission_order() {
        let locks = Arc::new(TabLocks::new(Duration::from_secs(5)));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("tab-1", async {
                        order.lock().unwrap().push(format!("start-{i}"));
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        order.lock().unwrap().push(format!("end-{i}"));
                        Ok(())
                    })
                    .await
            }));
            // Give each spawn a chance to install itself before the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let order = order.lock().unwrap().clone();
        // Every start is immediately followed by its own end.
        for pair in order.chunks(2) {
            assert_eq!(pair[0].replace("start", "end"), pair[1]);
        }
        assert_eq!(locks.slot_count(), 0);
    }

    #[tokio::test]
    async fn different_tabs_do_not_block_each_other() {
        let locks = Arc::new(TabLocks::new(Duration::from_secs(5)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for tab in ["a", "b", "c"] {
            let locks = Arc::clone(&locks);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock(tab, async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn wait_timeout_fails_without_running_op() {
        let locks = Arc::new(TabLocks::new(Duration::from_millis(50)));

        let holder = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .with_lock("tab-1", async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let err = locks
            .with_lock("tab-1", async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn op_error_still_releases_the_lock() {
        let locks = TabLocks::new(Duration::from_secs(1));
        let err: Result<()> = locks
            .with_lock("tab-1", async { Err(CoreError::validation("boom")) })
            .await;
        assert!(err.is_err());

        // Next op on the same tab proceeds immediately.
        locks.with_lock("tab-1", async { Ok(()) }).await.unwrap();
        assert_eq!(locks.slot_count(), 0);
    }

    #[tokio::test]
    async fn clear_removes_residue() {
        let locks = Arc::new(TabLocks::new(Duration::from_secs(1)));
        let locks_clone = Arc::clone(&locks);
        let handle = tokio::spawn(async move {
            locks_clone
                .with_lock("tab-1", async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.clear("tab-1");
        assert_eq!(locks.slot_count(), 0);
        handle.await.unwrap().unwrap();
    }
}
