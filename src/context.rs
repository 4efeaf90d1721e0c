//! Shared merge context.

use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    merge::{MergeError, MergeMetrics},
    option::MergeOptions,
    storage::{local::LocalStorage, mem::MemStorage, ChunkStorage},
    tree::{FileMetadataStore, MemMetadataStore, MetadataStore},
};

const CHUNK_DIR: &str = "chunks";

/// Collaborators a tree merges through.
///
/// Chunk ids are allocated per tree, so two trees must not share one chunk
/// namespace; give each its own storage root.
pub struct MergeContext {
    pub(crate) storage: Arc<dyn ChunkStorage>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) option: MergeOptions,
    schema_lock: Mutex<()>,
    pub(crate) metrics: MergeMetrics,
}

impl MergeContext {
    /// Bundle the storage layer, the metadata store, and the merge options.
    pub fn new(
        storage: Arc<dyn ChunkStorage>,
        metadata: Arc<dyn MetadataStore>,
        option: MergeOptions,
    ) -> Self {
        Self {
            storage,
            metadata,
            option,
            schema_lock: Mutex::new(()),
            metrics: MergeMetrics::default(),
        }
    }

    /// Chunks and metadata held in process memory.
    pub fn in_memory(option: MergeOptions) -> Self {
        Self::new(
            Arc::new(MemStorage::new()),
            Arc::new(MemMetadataStore::new()),
            option,
        )
    }

    /// Metadata documents in `dir`, chunk files in `dir/chunks`.
    pub fn local(dir: impl AsRef<Path>, option: MergeOptions) -> Result<Self, MergeError> {
        let dir = dir.as_ref();
        Ok(Self::new(
            Arc::new(LocalStorage::new(dir.join(CHUNK_DIR))?),
            Arc::new(FileMetadataStore::new(dir)?),
            option,
        ))
    }

    /// Chunk and bloom filter storage.
    pub fn storage(&self) -> &Arc<dyn ChunkStorage> {
        &self.storage
    }

    /// Durable tree metadata store.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Merge tuning knobs.
    pub fn option(&self) -> &MergeOptions {
        &self.option
    }

    /// Merge counters.
    pub fn metrics(&self) -> &MergeMetrics {
        &self.metrics
    }

    /// Run `f` while holding the schema lock, which serializes changes to the
    /// global store namespace. Never taken while a tree lock is held.
    pub(crate) fn with_schema_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.schema_lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

impl std::fmt::Debug for MergeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeContext")
            .field("option", &self.option)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}
