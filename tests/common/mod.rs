//! Common test utilities for integration tests.
#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use lsm_merge::{
    storage::ChunkReader, BloomFilter, Chunk, ChunkId, ChunkStorage, ChunkWriter, LsmTree,
    MemMetadataStore, MergeContext, MergeError, MetadataStore, TreeMetadata,
};

/// `count` distinct random keys, in ascending order.
pub fn random_keys(rng: &mut fastrand::Rng, count: usize) -> Vec<Bytes> {
    let mut keys = BTreeSet::new();
    while keys.len() < count {
        keys.insert(format!("key-{:016x}", rng.u64(..)));
    }
    keys.into_iter().map(Bytes::from).collect()
}

/// Split `keys` into sorted runs of the given sizes.
pub fn partition(rng: &mut fastrand::Rng, mut keys: Vec<Bytes>, sizes: &[usize]) -> Vec<Vec<Bytes>> {
    rng.shuffle(&mut keys);
    let mut runs = Vec::with_capacity(sizes.len());
    let mut rest = keys.as_slice();
    for size in sizes {
        let (run, tail) = rest.split_at(*size);
        let mut run = run.to_vec();
        run.sort();
        runs.push(run);
        rest = tail;
    }
    runs
}

/// Write `keys` (ascending) into a fresh store and describe it as a sealed chunk.
pub fn seal_chunk(storage: &dyn ChunkStorage, id: u64, keys: &[Bytes]) -> Arc<Chunk> {
    let id = ChunkId::new(id);
    let (data_ref, mut writer) = storage.create_chunk_store(id).expect("create store");
    for key in keys {
        writer
            .insert(key.clone(), value_for(key, id))
            .expect("insert");
    }
    let count = writer.finish().expect("finish");
    Arc::new(Chunk::sealed(id, data_ref, None, count))
}

/// Value stored for `key` by the chunk `id`.
pub fn value_for(key: &Bytes, id: ChunkId) -> Bytes {
    let mut value = key.to_vec();
    value.extend_from_slice(format!("@{id}").as_bytes());
    Bytes::from(value)
}

/// Build a tree whose sealed chunks hold `runs`, newest first, behind an
/// empty mutable head. Newer chunks get higher ids.
pub fn tree_with_runs(ctx: Arc<MergeContext>, name: &str, runs: &[Vec<Bytes>]) -> LsmTree {
    let storage = Arc::clone(ctx.storage());
    let head_id = ChunkId::new(runs.len() as u64 + 1);
    let mut live = vec![Arc::new(Chunk::mutable(head_id, storage.chunk_ref(head_id)))];
    for (idx, run) in runs.iter().enumerate() {
        live.push(seal_chunk(storage.as_ref(), (runs.len() - idx) as u64, run));
    }
    LsmTree::from_chunks(name, ctx, live).expect("tree")
}

/// Play the write path: fill the current head with `keys`, mark it durable,
/// and rotate in a fresh head.
pub fn flush_head(tree: &LsmTree, keys: &[Bytes]) -> Arc<Chunk> {
    let head = Arc::clone(&tree.live_chunks()[0]);
    let storage = Arc::clone(tree.context().storage());
    let (data_ref, mut writer) = storage.create_chunk_store(head.id()).expect("create store");
    assert_eq!(data_ref, head.data_ref());
    for key in keys {
        writer
            .insert(key.clone(), value_for(key, head.id()))
            .expect("insert");
    }
    let count = writer.finish().expect("finish");
    assert!(head.record_inserts(count));
    assert!(head.mark_on_disk());
    tree.switch_head().expect("switch head");
    head
}

/// Metadata store whose writes can be made to fail on demand.
pub struct FailingMetadataStore {
    inner: Arc<dyn MetadataStore>,
    fail: AtomicBool,
}

impl Default for FailingMetadataStore {
    fn default() -> Self {
        Self::new(Arc::new(MemMetadataStore::new()))
    }
}

impl FailingMetadataStore {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }
}

impl MetadataStore for FailingMetadataStore {
    fn write_tree_metadata(&self, metadata: &TreeMetadata) -> Result<(), MergeError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(std::io::Error::other("injected metadata write failure").into());
        }
        self.inner.write_tree_metadata(metadata)
    }

    fn read_tree_metadata(&self, name: &str) -> Result<Option<TreeMetadata>, MergeError> {
        self.inner.read_tree_metadata(name)
    }
}

/// Storage wrapper whose bloom writes and deletes can be made to fail on demand.
pub struct FailingStorage {
    inner: Arc<dyn ChunkStorage>,
    fail_bloom: AtomicBool,
    fail_remove: AtomicBool,
}

impl FailingStorage {
    pub fn new(inner: Arc<dyn ChunkStorage>) -> Self {
        Self {
            inner,
            fail_bloom: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
        }
    }

    pub fn set_failing_bloom(&self, fail: bool) {
        self.fail_bloom.store(fail, Ordering::Release);
    }

    pub fn set_failing_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::Release);
    }
}

impl ChunkStorage for FailingStorage {
    fn chunk_ref(&self, id: ChunkId) -> String {
        self.inner.chunk_ref(id)
    }

    fn create_chunk_store(
        &self,
        id: ChunkId,
    ) -> Result<(String, Box<dyn ChunkWriter>), MergeError> {
        self.inner.create_chunk_store(id)
    }

    fn open_chunk_reader(&self, data_ref: &str) -> Result<ChunkReader, MergeError> {
        self.inner.open_chunk_reader(data_ref)
    }

    fn remove_chunk_store(&self, data_ref: &str) -> Result<(), MergeError> {
        if self.fail_remove.load(Ordering::Acquire) {
            return Err(std::io::Error::other("injected delete failure").into());
        }
        self.inner.remove_chunk_store(data_ref)
    }

    fn contains_chunk_store(&self, data_ref: &str) -> bool {
        self.inner.contains_chunk_store(data_ref)
    }

    fn put_bloom(&self, id: ChunkId, filter: &BloomFilter) -> Result<String, MergeError> {
        if self.fail_bloom.load(Ordering::Acquire) {
            return Err(std::io::Error::other("injected bloom write failure").into());
        }
        self.inner.put_bloom(id, filter)
    }

    fn load_bloom(&self, bloom_ref: &str) -> Result<BloomFilter, MergeError> {
        self.inner.load_bloom(bloom_ref)
    }

    fn remove_bloom(&self, bloom_ref: &str) -> Result<(), MergeError> {
        self.inner.remove_bloom(bloom_ref)
    }
}
