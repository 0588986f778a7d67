//! Seen-set filter: approximate membership over processed item keys.
//!
//! A `SeenSet` is a list of Bloom filter generations. The first generation
//! is sized from `FilterConfig`. Under `GrowthPolicy::Scale`, once the
//! newest generation holds its full capacity a new one is opened with twice
//! the capacity and half the error rate, which bounds the compound
//! false-positive rate at roughly twice the configured target no matter how
//! far the crawl outgrows its estimate. Under `GrowthPolicy::Fixed` the
//! single filter keeps absorbing inserts and its error rate climbs; every
//! such insert is counted in `FilterStats::capacity_exceeded`.
//!
//! Either way there are no false negatives: a key that was inserted always
//! answers `might_contain == true`.

mod bloom;
mod codec;

pub use bloom::BloomFilter;

use serde::Serialize;

use crate::error::Result;
use crate::models::{FilterConfig, GrowthPolicy, ItemKey};

/// Capacity multiplier between generations.
const GROWTH_FACTOR: u64 = 2;

/// Error-rate multiplier between generations.
const TIGHTENING_RATIO: f64 = 0.5;

/// Observable filter health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterStats {
    pub generations: usize,
    pub items: u64,
    pub capacity: u64,
    pub bits: u64,
    pub estimated_fp_rate: f64,
    /// Inserts that arrived after the sizing assumption was used up
    pub capacity_exceeded: u64,
}

/// Probabilistic set of processed item keys.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenSet {
    generations: Vec<BloomFilter>,
    growth: GrowthPolicy,
    capacity_exceeded: u64,
}

impl SeenSet {
    /// Empty set sized from configuration.
    pub fn new(config: &FilterConfig) -> Self {
        Self::with_capacity(config.capacity, config.false_positive_rate, config.growth)
    }

    pub fn with_capacity(capacity: u64, fp_rate: f64, growth: GrowthPolicy) -> Self {
        Self {
            generations: vec![BloomFilter::with_rate(capacity, fp_rate)],
            growth,
            capacity_exceeded: 0,
        }
    }

    /// Record a key. Returns `false` if it was (probably) already present.
    pub fn insert(&mut self, key: &ItemKey) -> bool {
        if self.might_contain(key) {
            return false;
        }

        if self.active().is_full() {
            self.capacity_exceeded += 1;
            match self.growth {
                GrowthPolicy::Scale => self.open_generation(),
                GrowthPolicy::Fixed => {
                    if self.capacity_exceeded.is_power_of_two() {
                        log::warn!(
                            "Seen-set over capacity: {} inserts beyond {} (estimated false-positive rate {:.5})",
                            self.capacity_exceeded,
                            self.active().capacity(),
                            self.active().estimated_fp_rate()
                        );
                    }
                }
            }
        }

        let active = self.active_mut();
        active.insert(key);
        true
    }

    /// `false` means the key was definitely never inserted.
    pub fn might_contain(&self, key: &ItemKey) -> bool {
        self.generations.iter().any(|g| g.contains(key))
    }

    /// Distinct keys recorded across all generations.
    pub fn len(&self) -> u64 {
        self.generations.iter().map(BloomFilter::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn growth(&self) -> GrowthPolicy {
        self.growth
    }

    pub fn generations(&self) -> &[BloomFilter] {
        &self.generations
    }

    pub fn stats(&self) -> FilterStats {
        let miss_all: f64 = self
            .generations
            .iter()
            .map(|g| 1.0 - g.estimated_fp_rate())
            .product();
        FilterStats {
            generations: self.generations.len(),
            items: self.len(),
            capacity: self.generations.iter().map(BloomFilter::capacity).sum(),
            bits: self.generations.iter().map(BloomFilter::num_bits).sum(),
            estimated_fp_rate: 1.0 - miss_all,
            capacity_exceeded: self.capacity_exceeded,
        }
    }

    /// Serialize to the checksummed snapshot format.
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Parse a snapshot. `path` is only used in error messages.
    pub fn from_bytes(bytes: &[u8], path: &str) -> Result<Self> {
        codec::decode(bytes, path)
    }

    fn active(&self) -> &BloomFilter {
        // generations is never empty: constructors and the codec guarantee one
        &self.generations[self.generations.len() - 1]
    }

    fn active_mut(&mut self) -> &mut BloomFilter {
        let last = self.generations.len() - 1;
        &mut self.generations[last]
    }

    fn open_generation(&mut self) {
        let (capacity, fp_rate) = {
            let active = self.active();
            (
                active.capacity().saturating_mul(GROWTH_FACTOR),
                active.fp_rate() * TIGHTENING_RATIO,
            )
        };
        log::warn!(
            "Seen-set generation {} full; opening generation {} (capacity {}, fp rate {})",
            self.generations.len(),
            self.generations.len() + 1,
            capacity,
            fp_rate
        );
        self.generations.push(BloomFilter::with_rate(capacity, fp_rate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ItemKey {
        ItemKey::derive(s)
    }

    #[test]
    fn test_no_false_negatives() {
        let mut set = SeenSet::with_capacity(2_000, 0.01, GrowthPolicy::Scale);
        for i in 0..5_000 {
            set.insert(&key(&format!("https://example.com/item/{i}")));
        }
        for i in 0..5_000 {
            assert!(set.might_contain(&key(&format!("https://example.com/item/{i}"))));
        }
    }

    #[test]
    fn test_false_positive_rate_within_tolerance() {
        let mut set = SeenSet::with_capacity(10_000, 0.01, GrowthPolicy::Scale);
        for i in 0..10_000 {
            set.insert(&key(&format!("inserted-{i}")));
        }
        let probes = 50_000;
        let hits = (0..probes)
            .filter(|i| set.might_contain(&key(&format!("absent-{i}"))))
            .count();
        let rate = hits as f64 / probes as f64;
        assert!(rate < 0.015, "false-positive rate {rate}");
        assert_eq!(set.stats().generations, 1);
    }

    #[test]
    fn test_site_a_scenario() {
        let mut set = SeenSet::with_capacity(10_000, 0.01, GrowthPolicy::Scale);
        for i in 1..=5_000 {
            set.insert(&key(&format!("item-{i}")));
        }
        assert!(set.might_contain(&key("item-1")));
        assert!(set.might_contain(&key("item-5000")));
        // at half fill the rate is far below 1%; one specific absent key
        // collides with negligible probability and the digest is fixed
        assert!(!set.might_contain(&key("item-9999")));
    }

    #[test]
    fn test_scale_opens_generations() {
        let mut set = SeenSet::with_capacity(100, 0.01, GrowthPolicy::Scale);
        for i in 0..1_000 {
            set.insert(&key(&format!("k{i}")));
        }
        let stats = set.stats();
        assert!(stats.generations >= 3, "{stats:?}");
        assert!(stats.capacity_exceeded >= 2);
        assert!(stats.capacity >= 1_000);
        assert!(set.generations()[1].fp_rate() < set.generations()[0].fp_rate());
        for i in 0..1_000 {
            assert!(set.might_contain(&key(&format!("k{i}"))));
        }
    }

    #[test]
    fn test_fixed_policy_counts_overflow() {
        let mut set = SeenSet::with_capacity(100, 0.01, GrowthPolicy::Fixed);
        for i in 0..300 {
            set.insert(&key(&format!("k{i}")));
        }
        let stats = set.stats();
        assert_eq!(stats.generations, 1);
        assert!(stats.capacity_exceeded >= 100, "{stats:?}");
        assert!(stats.estimated_fp_rate > 0.01);
    }

    #[test]
    fn test_insert_reports_duplicates() {
        let mut set = SeenSet::new(&FilterConfig::default());
        assert!(set.is_empty());
        assert!(set.insert(&key("a")));
        assert!(!set.insert(&key("a")));
        assert_eq!(set.len(), 1);
    }
}
