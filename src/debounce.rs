//! Per-key trailing debounce with an upper bound.
//!
//! Each new schedule for a key replaces the pending one. Once a key has been pending for
//! `max_debounce`, the next schedule runs immediately instead of postponing again.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

struct Timer {
    start: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct Debouncer {
    debounce: Duration,
    max_debounce: Duration,
    timers: DashMap<String, Timer>,
    generation: AtomicU64,
}

impl Debouncer {
    pub fn new(debounce: Duration, max_debounce: Duration) -> Self {
        Self { debounce, max_debounce, timers: DashMap::new(), generation: AtomicU64::new(0) }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.timers.contains_key(id)
    }

    /// Drops the pending task for `id`, if any.
    pub fn cancel(&self, id: &str) {
        if let Some((_, timer)) = self.timers.remove(id) {
            timer.handle.abort();
        }
    }

    pub fn schedule<F>(self: &Arc<Self>, id: &str, task: F, immediately: bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        let start = match self.timers.remove(id) {
            Some((_, old)) => {
                old.handle.abort();
                old.start
            }
            None => now,
        };

        if immediately || now.duration_since(start) >= self.max_debounce {
            tokio::spawn(task);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let key = id.to_owned();
        let deadline = now + self.debounce;
        // hold the shard until the timer is registered, so a zero delay can't miss it
        let entry = self.timers.entry(key.clone());
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            if this.timers.remove_if(&key, |_, t| t.generation == generation).is_some() {
                task.await;
            }
        });
        entry.insert(Timer { start, generation, handle });
    }
}
