//! Storage-layer surface consumed by the merge engine.
//!
//! Chunk stores are append-only sorted runs of key/value pairs. The merge
//! engine only ever creates a store, bulk-loads it in ascending key order, and
//! reads existing stores front to back.

pub mod local;
pub mod mem;

use bytes::Bytes;

use crate::{bloom::BloomFilter, chunk::ChunkId, merge::MergeError};

/// One key/value pair.
pub type Entry = (Bytes, Bytes);

/// Forward iterator over a chunk store in ascending key order.
pub type ChunkReader = Box<dyn Iterator<Item = Result<Entry, MergeError>> + Send>;

/// Bulk-load writer for a freshly created chunk store.
pub trait ChunkWriter: Send {
    /// Append a pair. Keys must be strictly ascending.
    fn insert(&mut self, key: Bytes, value: Bytes) -> Result<(), MergeError>;

    /// Make the written data durable and return the number of pairs stored.
    fn finish(self: Box<Self>) -> Result<u64, MergeError>;

    /// Drop everything written so far and remove the store.
    fn abort(self: Box<Self>) -> Result<(), MergeError>;
}

/// Chunk and bloom filter stores backing a tree.
pub trait ChunkStorage: Send + Sync {
    /// Reference under which the store for chunk `id` lives or will live.
    fn chunk_ref(&self, id: ChunkId) -> String;

    /// Create an empty store named after `id`, returning its reference and a writer.
    fn create_chunk_store(&self, id: ChunkId)
        -> Result<(String, Box<dyn ChunkWriter>), MergeError>;

    /// Open a reader over a finished store.
    fn open_chunk_reader(&self, data_ref: &str) -> Result<ChunkReader, MergeError>;

    /// Delete a store.
    fn remove_chunk_store(&self, data_ref: &str) -> Result<(), MergeError>;

    /// Whether a store exists behind `data_ref`.
    fn contains_chunk_store(&self, data_ref: &str) -> bool;

    /// Durably write the bloom filter for chunk `id`, returning its reference.
    fn put_bloom(&self, id: ChunkId, filter: &BloomFilter) -> Result<String, MergeError>;

    /// Read back a bloom filter.
    fn load_bloom(&self, bloom_ref: &str) -> Result<BloomFilter, MergeError>;

    /// Delete a bloom filter.
    fn remove_bloom(&self, bloom_ref: &str) -> Result<(), MergeError>;
}

/// Enforces strictly ascending keys for bulk loads.
#[derive(Debug, Default)]
pub(crate) struct AscendingKeys {
    last: Option<Bytes>,
}

impl AscendingKeys {
    pub(crate) fn check(&mut self, key: &Bytes) -> Result<(), MergeError> {
        if let Some(last) = &self.last {
            if key <= last {
                return Err(MergeError::inconsistent(format!(
                    "bulk load key {key:?} does not follow {last:?}"
                )));
            }
        }
        self.last = Some(key.clone());
        Ok(())
    }
}
