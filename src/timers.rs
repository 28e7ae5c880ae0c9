//! Keyed in-memory timers for retries and delivery timeouts.
//!
//! Nothing here is persisted: a restart drops every armed timer, and the
//! reconciliation sweeper rebuilds retry state from the durable store.
//! Timers are a latency optimization, not a correctness requirement.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// One outstanding timer per key; arming a key again cancels the previous
/// timer. Entries carry a generation stamp so a task that lost a re-arm
/// race cannot evict its replacement from the map.
#[derive(Default)]
struct TimerMap {
    entries: Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>,
    next_gen: AtomicU64,
}

impl TimerMap {
    fn arm<F>(&self, key: &str, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_gen.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let prior = self
            .entries
            .lock()
            .insert(key.to_string(), (generation, token.clone()));
        if let Some((_, prev)) = prior {
            prev.cancel();
        }

        let entries = Arc::clone(&self.entries);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let still_current = {
                        let mut guard = entries.lock();
                        match guard.get(&key) {
                            Some((gen, _)) if *gen == generation => {
                                guard.remove(&key);
                                true
                            }
                            _ => false,
                        }
                    };
                    if still_current {
                        on_fire.await;
                    }
                }
            }
        });
    }

    fn cancel(&self, key: &str) -> bool {
        match self.entries.lock().remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_armed(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Bounded-retry timing: at most one armed retry timer per lead. The delay
/// is constant (no escalation with attempt count); the cap lives in the
/// orchestrator, which decides whether to schedule at all.
#[derive(Default)]
pub struct RetryScheduler {
    timers: TimerMap,
}

impl RetryScheduler {
    /// Arm the retry timer for a lead, replacing any prior timer.
    pub fn schedule<F>(&self, lead_id: &str, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.timers.arm(lead_id, delay, on_fire);
    }

    /// Cancel on delivery confirmation or opt-out. Returns whether a timer
    /// was armed.
    pub fn cancel(&self, lead_id: &str) -> bool {
        self.timers.cancel(lead_id)
    }

    pub fn is_armed(&self, lead_id: &str) -> bool {
        self.timers.is_armed(lead_id)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

/// Declares a send undelivered when no provider confirmation arrives in
/// time. Keyed by provider message id.
#[derive(Default)]
pub struct TimeoutMonitor {
    timers: TimerMap,
}

impl TimeoutMonitor {
    pub fn arm<F>(&self, provider_message_id: &str, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.timers.arm(provider_message_id, delay, on_fire);
    }

    /// Cancel on any terminal webhook. Returns whether a timer was armed.
    pub fn cancel(&self, provider_message_id: &str) -> bool {
        self.timers.cancel(provider_message_id)
    }

    pub fn is_armed(&self, provider_message_id: &str) -> bool {
        self.timers.is_armed(provider_message_id)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_timer_fires_once() {
        let scheduler = RetryScheduler::default();
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        scheduler.schedule("lead-1", Duration::from_millis(10), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.is_armed("lead-1"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed("lead-1"));
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let scheduler = RetryScheduler::default();
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        scheduler.schedule("lead-1", Duration::from_millis(20), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel("lead-1"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.cancel("lead-1"));
    }

    #[tokio::test]
    async fn test_rearm_replaces_prior_timer() {
        let scheduler = RetryScheduler::default();
        let fired = Arc::new(AtomicU32::new(0));
        let f1 = Arc::clone(&fired);
        scheduler.schedule("lead-1", Duration::from_millis(20), async move {
            f1.fetch_add(10, Ordering::SeqCst);
        });
        let f2 = Arc::clone(&fired);
        scheduler.schedule("lead-1", Duration::from_millis(40), async move {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Only the replacement fired.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let monitor = TimeoutMonitor::default();
        let fired = Arc::new(AtomicU32::new(0));
        for key in ["SM1", "SM2"] {
            let f = Arc::clone(&fired);
            monitor.arm(key, Duration::from_millis(10), async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        monitor.cancel("SM1");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
