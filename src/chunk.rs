//! Chunk descriptors: metadata for one sorted run of an LSM tree.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use serde::{Deserialize, Serialize};

use crate::{bloom::BloomFilter, merge::MergeError, storage::ChunkStorage, tree::ChunkMeta};

/// Identifier of a chunk, unique within its tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(u64);

impl ChunkId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Access the raw identifier value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

/// Metadata for one sorted run.
///
/// The newest chunk of a tree is mutable and filled by the write path. Once
/// its data is durable it is marked on disk and its record count no longer
/// changes. Sealed chunks are read-only until a merge retires them.
pub struct Chunk {
    id: ChunkId,
    data_ref: String,
    bloom_ref: Option<String>,
    record_count: AtomicU64,
    on_disk: AtomicBool,
    active_readers: AtomicUsize,
    bloom: OnceLock<Arc<BloomFilter>>,
}

impl Chunk {
    /// A fresh, empty, mutable chunk.
    pub fn mutable(id: ChunkId, data_ref: impl Into<String>) -> Self {
        Self {
            id,
            data_ref: data_ref.into(),
            bloom_ref: None,
            record_count: AtomicU64::new(0),
            on_disk: AtomicBool::new(false),
            active_readers: AtomicUsize::new(0),
            bloom: OnceLock::new(),
        }
    }

    /// A chunk whose data is already durable.
    pub fn sealed(
        id: ChunkId,
        data_ref: impl Into<String>,
        bloom_ref: Option<String>,
        record_count: u64,
    ) -> Self {
        Self {
            id,
            data_ref: data_ref.into(),
            bloom_ref,
            record_count: AtomicU64::new(record_count),
            on_disk: AtomicBool::new(true),
            active_readers: AtomicUsize::new(0),
            bloom: OnceLock::new(),
        }
    }

    pub(crate) fn from_meta(meta: &ChunkMeta) -> Self {
        let mut chunk = Self::sealed(
            meta.id,
            meta.data_ref.clone(),
            meta.bloom_ref.clone(),
            meta.record_count,
        );
        chunk.on_disk = AtomicBool::new(meta.on_disk);
        chunk
    }

    pub(crate) fn to_meta(&self) -> ChunkMeta {
        ChunkMeta {
            id: self.id,
            data_ref: self.data_ref.clone(),
            bloom_ref: self.bloom_ref.clone(),
            record_count: self.record_count(),
            on_disk: self.is_on_disk(),
        }
    }

    /// Identifier of this chunk.
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Reference to the chunk's sorted data store.
    pub fn data_ref(&self) -> &str {
        &self.data_ref
    }

    /// Reference to the chunk's bloom filter, absent for empty chunks.
    pub fn bloom_ref(&self) -> Option<&str> {
        self.bloom_ref.as_deref()
    }

    /// Number of key/value pairs held by the chunk.
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    /// Account records appended by the write path. Ignored once the chunk is on disk.
    pub fn record_inserts(&self, count: u64) -> bool {
        if self.is_on_disk() {
            return false;
        }
        self.record_count.fetch_add(count, Ordering::AcqRel);
        true
    }

    /// Whether the chunk's data is durable.
    pub fn is_on_disk(&self) -> bool {
        self.on_disk.load(Ordering::Acquire)
    }

    /// Mark the chunk's data durable. Returns `false` if it already was.
    pub fn mark_on_disk(&self) -> bool {
        !self.on_disk.swap(true, Ordering::AcqRel)
    }

    /// Outstanding cursors currently reading this chunk.
    pub fn active_readers(&self) -> usize {
        self.active_readers.load(Ordering::Acquire)
    }

    /// Durable and unpinned at the moment of the call.
    pub(crate) fn is_merge_eligible(&self) -> bool {
        self.is_on_disk() && self.active_readers() == 0
    }

    /// Load (once) and return the chunk's bloom filter.
    pub(crate) fn bloom(
        &self,
        storage: &dyn ChunkStorage,
    ) -> Result<Option<Arc<BloomFilter>>, MergeError> {
        let Some(bloom_ref) = self.bloom_ref.as_deref() else {
            return Ok(None);
        };
        if let Some(filter) = self.bloom.get() {
            return Ok(Some(Arc::clone(filter)));
        }
        let filter = Arc::new(storage.load_bloom(bloom_ref)?);
        Ok(Some(Arc::clone(self.bloom.get_or_init(|| filter))))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("data_ref", &self.data_ref)
            .field("bloom_ref", &self.bloom_ref)
            .field("record_count", &self.record_count())
            .field("on_disk", &self.is_on_disk())
            .field("active_readers", &self.active_readers())
            .finish()
    }
}

/// Keeps a chunk's reader count raised for as long as it is alive.
#[derive(Debug)]
pub struct ChunkPin {
    chunk: Arc<Chunk>,
}

impl ChunkPin {
    /// Register one more reader on `chunk`.
    pub fn new(chunk: Arc<Chunk>) -> Self {
        chunk.active_readers.fetch_add(1, Ordering::AcqRel);
        Self { chunk }
    }

    /// The pinned chunk.
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }
}

impl Clone for ChunkPin {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.chunk))
    }
}

impl Deref for ChunkPin {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

impl Drop for ChunkPin {
    fn drop(&mut self) {
        self.chunk.active_readers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Chunk, ChunkId, ChunkPin};

    #[test]
    fn on_disk_is_set_once() {
        let chunk = Chunk::mutable(ChunkId::new(3), "mem:chunk-000003");
        assert!(!chunk.is_on_disk());
        assert!(chunk.record_inserts(5));
        assert!(chunk.mark_on_disk());
        assert!(!chunk.mark_on_disk());
        assert!(!chunk.record_inserts(1));
        assert_eq!(chunk.record_count(), 5);
    }

    #[test]
    fn pins_gate_merge_eligibility() {
        let chunk = Arc::new(Chunk::sealed(ChunkId::new(1), "a", None, 10));
        assert!(chunk.is_merge_eligible());
        let pin = ChunkPin::new(Arc::clone(&chunk));
        let second = pin.clone();
        assert_eq!(chunk.active_readers(), 2);
        assert!(!chunk.is_merge_eligible());
        drop(pin);
        drop(second);
        assert_eq!(chunk.active_readers(), 0);
        assert!(chunk.is_merge_eligible());
    }

    #[test]
    fn ids_render_zero_padded() {
        assert_eq!(ChunkId::new(42).to_string(), "000042");
    }
}
