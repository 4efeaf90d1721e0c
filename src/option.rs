//! Tuning knobs for major merges.

const DEFAULT_HANDLE_BUDGET: usize = 1000;
const DEFAULT_BLOOM_BITS_PER_KEY: u32 = 16;
const DEFAULT_BLOOM_HASH_COUNT: u32 = 8;

/// Configuration shared by every merge driven through a [`crate::MergeContext`].
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub(crate) handle_budget: usize,
    pub(crate) bloom_bits_per_key: u32,
    pub(crate) bloom_hash_count: u32,
    pub(crate) bloom_enabled: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            handle_budget: DEFAULT_HANDLE_BUDGET,
            bloom_bits_per_key: DEFAULT_BLOOM_BITS_PER_KEY,
            bloom_hash_count: DEFAULT_BLOOM_HASH_COUNT,
            bloom_enabled: true,
        }
    }
}

impl MergeOptions {
    /// Number of chunk handles the process may hold pinned at once. A single
    /// merge may consume at most half of them.
    pub fn handle_budget(self, handle_budget: usize) -> Self {
        MergeOptions {
            handle_budget,
            ..self
        }
    }

    /// Bits reserved in the merged chunk's bloom filter for every expected record.
    pub fn bloom_bits_per_key(self, bloom_bits_per_key: u32) -> Self {
        MergeOptions {
            bloom_bits_per_key: bloom_bits_per_key.max(1),
            ..self
        }
    }

    /// Number of bit positions set per key in the bloom filter.
    pub fn bloom_hash_count(self, bloom_hash_count: u32) -> Self {
        MergeOptions {
            bloom_hash_count: bloom_hash_count.max(1),
            ..self
        }
    }

    /// Build a bloom filter for non-empty merge outputs.
    pub fn bloom_enabled(self, bloom_enabled: bool) -> Self {
        MergeOptions {
            bloom_enabled,
            ..self
        }
    }

    /// Upper bound on the number of chunks consumed by one merge.
    pub(crate) fn max_span(&self) -> usize {
        self.handle_budget / 2
    }
}
