//! Bloom filters built for merged chunks.
//!
//! A [`BloomBuilder`] is sized once for the number of records a merge expects
//! to write, populated key by key while the merge streams, and finalized into
//! a durable filter owned by the storage layer.

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::{chunk::ChunkId, merge::MergeError, storage::ChunkStorage};

const PRIMARY_SEED: u64 = 0x9e37_79b9_7f4a_7c15;
const SECONDARY_SEED: u64 = 0xc2b2_ae3d_27d4_eb4f;
const HEADER_LEN: usize = 12;

/// Fixed-size probabilistic set membership filter.
///
/// Bit positions use double hashing over two seeded xxh3 digests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Allocate an empty filter for `expected_records` keys.
    pub fn with_capacity(expected_records: u64, bits_per_key: u32, hash_count: u32) -> Self {
        let bit_count = expected_records
            .saturating_mul(u64::from(bits_per_key.max(1)))
            .max(64);
        let words = bit_count.div_ceil(64) as usize;
        Self {
            words: vec![0; words],
            bit_count: words as u64 * 64,
            hash_count: hash_count.max(1),
        }
    }

    /// Number of addressable bits.
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Number of bit positions per key.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Add `key` to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        let (mut h, delta) = hash_pair(key);
        for _ in 0..self.hash_count {
            let bit = h % self.bit_count;
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
            h = h.wrapping_add(delta);
        }
    }

    /// `false` means `key` was never inserted; `true` means it may have been.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (mut h, delta) = hash_pair(key);
        for _ in 0..self.hash_count {
            let bit = h % self.bit_count;
            if self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    /// Serialize as `bit_count:u64 | hash_count:u32 | words:[u64]`, little endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.words.len() * 8);
        buf.extend_from_slice(&self.bit_count.to_le_bytes());
        buf.extend_from_slice(&self.hash_count.to_le_bytes());
        for word in &self.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    /// Decode a filter produced by [`BloomFilter::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MergeError> {
        if bytes.len() < HEADER_LEN || (bytes.len() - HEADER_LEN) % 8 != 0 {
            return Err(MergeError::Checksum("bloom filter length".to_string()));
        }
        let (header, body) = bytes.split_at(HEADER_LEN);
        let mut bit_count = [0u8; 8];
        bit_count.copy_from_slice(&header[..8]);
        let mut hash_count = [0u8; 4];
        hash_count.copy_from_slice(&header[8..]);
        let bit_count = u64::from_le_bytes(bit_count);
        let hash_count = u32::from_le_bytes(hash_count);
        let words: Vec<u64> = body
            .chunks_exact(8)
            .map(|word| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(word);
                u64::from_le_bytes(raw)
            })
            .collect();
        if bit_count == 0 || bit_count != words.len() as u64 * 64 || hash_count == 0 {
            return Err(MergeError::Checksum("bloom filter header".to_string()));
        }
        Ok(Self {
            words,
            bit_count,
            hash_count,
        })
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = xxh3_64_with_seed(key, PRIMARY_SEED);
    let h2 = xxh3_64_with_seed(key, SECONDARY_SEED) | 1;
    (h1, h2)
}

/// Bloom filter under construction for one merge output.
#[derive(Debug)]
pub struct BloomBuilder {
    chunk_id: ChunkId,
    expected_records: u64,
    inserted: u64,
    filter: BloomFilter,
}

impl BloomBuilder {
    /// Size a builder for `expected_records` keys. Returns `None` for an empty
    /// merge output, which gets no filter at all.
    pub fn create(
        chunk_id: ChunkId,
        expected_records: u64,
        bits_per_key: u32,
        hash_count: u32,
    ) -> Option<Self> {
        if expected_records == 0 {
            return None;
        }
        Some(Self {
            chunk_id,
            expected_records,
            inserted: 0,
            filter: BloomFilter::with_capacity(expected_records, bits_per_key, hash_count),
        })
    }

    /// Record `key` in the filter.
    pub fn insert(&mut self, key: &[u8]) {
        self.filter.insert(key);
        self.inserted += 1;
    }

    /// Keys the builder was sized for.
    pub fn expected_records(&self) -> u64 {
        self.expected_records
    }

    /// Keys inserted so far.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Persist the filter and return its reference.
    ///
    /// Every key must have been inserted first; an early call yields an
    /// under-populated filter.
    pub fn finalize(self, storage: &dyn ChunkStorage) -> Result<String, MergeError> {
        storage.put_bloom(self.chunk_id, &self.filter)
    }

    /// Drop an incomplete filter. Nothing is staged in storage before
    /// [`BloomBuilder::finalize`], so there is nothing else to release.
    pub fn discard(self) {}
}
