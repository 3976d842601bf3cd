use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: FxHashMap::default() }
    }

    /// Delay before the next retry of `key`; records one more failure.
    pub fn when(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let factor = 1u32.checked_shl(exp.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map(|d| d.min(self.max)).unwrap_or(self.max)
    }

    pub fn num_requeues(&self, key: &K) -> u32 { self.failures.get(key).copied().unwrap_or(0) }

    pub fn forget(&mut self, key: &K) { self.failures.remove(key); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_failure_and_caps() {
        let mut rl = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(30));
        let d: Vec<u128> = (0..5).map(|_| rl.when(&"k").as_millis()).collect();
        assert_eq!(d, vec![5, 10, 20, 30, 30]);
        assert_eq!(rl.num_requeues(&"k"), 5);
        assert_eq!(rl.num_requeues(&"other"), 0);
        rl.forget(&"k");
        assert_eq!(rl.when(&"k"), Duration::from_millis(5));
    }

    #[test]
    fn huge_exponents_saturate_at_max() {
        let mut rl = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
        for _ in 0..64 { rl.when(&1u8); }
        assert_eq!(rl.when(&1u8), Duration::from_secs(300));
    }
}
