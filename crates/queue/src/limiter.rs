use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Default delay for the first failure of an item.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
/// Default upper bound for per-item delays.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Per-item exponential failure limiter: the n-th failure of a key waits
/// `base * 2^n`, capped at `max`. Counters live until [`forget`](Self::forget).
#[derive(Debug)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: FxHashMap::default() }
    }

    /// Record one more failure for `key` and return how long to wait before re-adding it.
    pub fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        if exp >= 32 {
            return self.max;
        }
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

impl<K: Eq + Hash + Clone> Default for ExponentialBackoff<K> {
    fn default() -> Self { Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut l = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let got: Vec<_> = (0..8).map(|_| l.when(&"a").as_millis()).collect();
        assert_eq!(got, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
        assert_eq!(l.num_requeues(&"a"), 8);
        assert_eq!(l.num_requeues(&"b"), 0);
    }

    #[test]
    fn forget_resets_counter() {
        let mut l = ExponentialBackoff::<&str>::default();
        l.when(&"a");
        l.when(&"a");
        l.forget(&"a");
        assert_eq!(l.num_requeues(&"a"), 0);
        assert_eq!(l.when(&"a"), DEFAULT_BASE_DELAY);
    }

    #[test]
    fn huge_failure_counts_stay_capped() {
        let mut l = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1));
        for _ in 0..40 { l.when(&1u8); }
        assert_eq!(l.when(&1u8), Duration::from_secs(1));
    }
}
