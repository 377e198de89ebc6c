//! certsync queue: deduplicating work queue keyed by item identity.
//!
//! At most one payload per key is pending and at most one worker holds a key at a
//! time. Adding a key that is already pending replaces its payload (last write wins);
//! adding a key that is being processed parks the payload until [`DedupQueue::done`].

#![forbid(unsafe_code)]

mod limiter;

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, trace};

pub use limiter::{ExponentialBackoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

struct State<K, V> {
    /// Keys ready to be handed out, FIFO.
    order: VecDeque<K>,
    /// Latest payload per key that still needs processing (queued or parked).
    dirty: FxHashMap<K, V>,
    /// Keys currently held by a worker.
    processing: FxHashSet<K>,
    shutting_down: bool,
}

pub struct DedupQueue<K, V> {
    state: Mutex<State<K, V>>,
    limiter: Mutex<ExponentialBackoff<K>>,
    notify: Notify,
}

impl<K, V> DedupQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::with_limiter(ExponentialBackoff::default())
    }

    pub fn with_limiter(limiter: ExponentialBackoff<K>) -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                dirty: FxHashMap::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            limiter: Mutex::new(limiter),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limiter(&self) -> MutexGuard<'_, ExponentialBackoff<K>> {
        self.limiter.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `item` under `key`. Ignored once the queue is shutting down.
    pub fn add(&self, key: K, item: V) {
        let mut st = self.state();
        if st.shutting_down {
            trace!("add after shutdown ignored");
            return;
        }
        metrics::counter!("certsync_queue_adds_total", 1u64);
        if st.dirty.insert(key.clone(), item).is_some() {
            // Already pending: payload replaced, position kept.
            metrics::counter!("certsync_queue_coalesced_total", 1u64);
            return;
        }
        if st.processing.contains(&key) {
            // Re-surfaced by `done`.
            return;
        }
        st.order.push_back(key);
        metrics::gauge!("certsync_queue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
    }

    /// Wait for the next item and mark its key as processing.
    /// Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<(K, V)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if st.shutting_down {
                    return None;
                }
                while let Some(key) = st.order.pop_front() {
                    if let Some(item) = st.dirty.remove(&key) {
                        st.processing.insert(key.clone());
                        metrics::gauge!("certsync_queue_depth", st.order.len() as f64);
                        if !st.order.is_empty() {
                            // Other waiters may still have work to pick up.
                            self.notify.notify_one();
                        }
                        return Some((key, item));
                    }
                }
            }
            notified.await;
        }
    }

    /// Release `key` after a `get`. Must be called exactly once per `get`, whatever the
    /// outcome. A payload added while the key was processing is queued again.
    pub fn done(&self, key: &K) {
        let mut st = self.state();
        st.processing.remove(key);
        if st.shutting_down || !st.dirty.contains_key(key) {
            return;
        }
        debug!("key re-queued after processing");
        st.order.push_back(key.clone());
        drop(st);
        self.notify.notify_one();
    }

    /// Clear retry bookkeeping for `key`.
    pub fn forget(&self, key: &K) {
        self.limiter().forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter().num_requeues(key)
    }

    /// Stop handing out items and wake every blocked `get`. Idempotent.
    pub fn shutdown(&self) {
        let mut st = self.state();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        drop(st);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> DedupQueue<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    /// Add `item` after the limiter's delay for `key`. Needs a tokio runtime.
    pub fn add_rate_limited(self: &Arc<Self>, key: K, item: V) {
        let delay = self.limiter().when(&key);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key, item);
        });
    }
}

impl<K: Eq + Hash + Clone, V> Default for DedupQueue<K, V> {
    fn default() -> Self { Self::new() }
}
