//! Revocation bloom filter
//!
//! A read-mostly filter over every known revoked JTI and user key. The
//! filter must stay a superset of the truth: a negative lookup proves
//! the entry is not revoked (for entries at least as old as the last
//! rebuild), while a positive lookup escalates to the slower tiers.

use growable_bloom_filter::GrowableBloom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Prefix distinguishing user entries from JTIs inside the filter
const USER_KEY_PREFIX: &str = "user:";

/// The filter key for a whole-user revocation
pub fn user_filter_key(user_id: &str) -> String {
    format!("{}{}", USER_KEY_PREFIX, user_id)
}

/// Atomically swappable bloom filter
pub struct RevocationFilter {
    filter: RwLock<GrowableBloom>,
    inserted: AtomicUsize,
    expected_items: usize,
    false_positive_rate: f64,
}

impl RevocationFilter {
    /// Create an empty filter sized for the expected population
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        Self {
            filter: RwLock::new(GrowableBloom::new(
                false_positive_rate,
                expected_items.max(1),
            )),
            inserted: AtomicUsize::new(0),
            expected_items: expected_items.max(1),
            false_positive_rate,
        }
    }

    /// Record an entry
    pub fn insert(&self, key: &str) {
        let mut filter = self.filter.write().expect("bloom filter lock poisoned");
        if filter.insert(key) {
            self.inserted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Whether the entry may be present
    ///
    /// `false` is definitive; `true` may be a false positive.
    pub fn contains(&self, key: &str) -> bool {
        self.filter
            .read()
            .expect("bloom filter lock poisoned")
            .contains(key)
    }

    /// A fresh filter sized for a rebuild of `population` entries
    pub fn fresh(&self, population: usize) -> GrowableBloom {
        GrowableBloom::new(
            self.false_positive_rate,
            population.max(self.expected_items),
        )
    }

    /// Swap in a rebuilt filter
    pub fn replace(&self, rebuilt: GrowableBloom, population: usize) {
        let mut filter = self.filter.write().expect("bloom filter lock poisoned");
        *filter = rebuilt;
        self.inserted.store(population, Ordering::Relaxed);
    }

    /// Approximate number of entries recorded since the last rebuild
    pub fn approximate_len(&self) -> usize {
        self.inserted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let filter = RevocationFilter::new(1000, 0.01);
        assert!(!filter.contains("jti-1"));
        filter.insert("jti-1");
        assert!(filter.contains("jti-1"));
        assert_eq!(filter.approximate_len(), 1);
    }

    #[test]
    fn test_no_false_negatives() {
        let filter = RevocationFilter::new(100, 0.01);
        let keys: Vec<String> = (0..500).map(|i| format!("jti-{}", i)).collect();
        for key in &keys {
            filter.insert(key);
        }
        for key in &keys {
            assert!(filter.contains(key), "false negative for {}", key);
        }
    }

    #[test]
    fn test_replace_swaps_population() {
        let filter = RevocationFilter::new(100, 0.01);
        filter.insert("old-entry");

        let mut rebuilt = filter.fresh(2);
        rebuilt.insert("new-entry");
        filter.replace(rebuilt, 1);

        assert!(filter.contains("new-entry"));
        assert!(!filter.contains("old-entry"));
        assert_eq!(filter.approximate_len(), 1);
    }

    #[test]
    fn test_user_keys_disjoint_from_jtis() {
        let filter = RevocationFilter::new(100, 0.01);
        filter.insert(&user_filter_key("7"));
        assert!(filter.contains("user:7"));
        assert!(!filter.contains("7"));
    }
}
