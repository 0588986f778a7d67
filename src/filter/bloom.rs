//! Single-generation Bloom filter over `ItemKey` digests.
//!
//! Bit positions come from double hashing the first 128 bits of the key's
//! SHA-256 digest (`h1 + i * h2 mod m`), so no extra hashing is needed at
//! query time and positions are stable across processes and platforms.

use std::f64::consts::LN_2;

use crate::models::ItemKey;

/// Upper bound on hash functions per key.
pub const MAX_HASHES: u32 = 32;

/// Smallest bitset we will allocate.
const MIN_BITS: u64 = 64;

/// Fixed-size Bloom filter sized for a capacity and target error rate.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    pub(super) words: Vec<u64>,
    pub(super) num_bits: u64,
    pub(super) num_hashes: u32,
    pub(super) capacity: u64,
    pub(super) fp_rate: f64,
    pub(super) len: u64,
}

impl BloomFilter {
    /// Size a filter so that `capacity` insertions keep the false-positive
    /// rate at or below `fp_rate`.
    ///
    /// `m = -n ln p / (ln 2)^2` bits and `k = (m / n) ln 2` hashes.
    pub fn with_rate(capacity: u64, fp_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let num_bits = ((-n * fp_rate.ln()) / (LN_2 * LN_2))
            .ceil()
            .max(MIN_BITS as f64) as u64;
        let num_hashes = ((num_bits as f64 / n) * LN_2)
            .round()
            .clamp(1.0, MAX_HASHES as f64) as u32;

        Self {
            words: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
            capacity: capacity.max(1),
            fp_rate,
            len: 0,
        }
    }

    fn positions(&self, key: &ItemKey) -> impl Iterator<Item = u64> {
        let (h1, h2) = key.hash_pair();
        // odd stride so successive probes never collapse onto one bit
        let h2 = h2 | 1;
        let m = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    /// Set the key's bits. Returns `false` when every bit was already set,
    /// meaning the key was (probably) present.
    pub fn insert(&mut self, key: &ItemKey) -> bool {
        let mut inserted = false;
        let positions: Vec<u64> = self.positions(key).collect();
        for idx in positions {
            let word = (idx / 64) as usize;
            let mask = 1u64 << (idx % 64);
            if self.words[word] & mask == 0 {
                inserted = true;
                self.words[word] |= mask;
            }
        }
        if inserted {
            self.len += 1;
        }
        inserted
    }

    /// `false` means definitely absent.
    pub fn contains(&self, key: &ItemKey) -> bool {
        self.positions(key).all(|idx| {
            let word = (idx / 64) as usize;
            self.words[word] & (1u64 << (idx % 64)) != 0
        })
    }

    /// Distinct insertions recorded.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn fp_rate(&self) -> f64 {
        self.fp_rate
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Whether the filter holds as many items as it was sized for.
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Expected false-positive rate at the current fill: `(1 - e^(-kn/m))^k`.
    pub fn estimated_fp_rate(&self) -> f64 {
        let k = self.num_hashes as f64;
        let fill = 1.0 - (-k * self.len as f64 / self.num_bits as f64).exp();
        fill.powf(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_matches_formula() {
        let filter = BloomFilter::with_rate(10_000, 0.01);
        // ~9.59 bits per item and 7 hashes for 1%
        assert!((95_000..=96_500).contains(&filter.num_bits()));
        assert_eq!(filter.num_hashes(), 7);
        assert_eq!(filter.words.len() as u64, filter.num_bits().div_ceil(64));
    }

    #[test]
    fn test_insert_then_contains() {
        let mut filter = BloomFilter::with_rate(100, 0.01);
        let key = ItemKey::derive("https://example.com/1");
        assert!(!filter.contains(&key));
        assert!(filter.insert(&key));
        assert!(filter.contains(&key));
        assert!(!filter.insert(&key));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_tiny_capacity_is_clamped() {
        let filter = BloomFilter::with_rate(0, 0.5);
        assert!(filter.num_bits() >= MIN_BITS);
        assert!(filter.num_hashes() >= 1);
        assert_eq!(filter.capacity(), 1);
    }

    #[test]
    fn test_estimated_rate_grows_with_fill() {
        let mut filter = BloomFilter::with_rate(1000, 0.01);
        let empty = filter.estimated_fp_rate();
        for i in 0..1000 {
            filter.insert(&ItemKey::derive(&format!("k{i}")));
        }
        let full = filter.estimated_fp_rate();
        assert!(empty < 1e-9);
        assert!(full > 0.005 && full < 0.02, "estimated {full}");
    }
}
