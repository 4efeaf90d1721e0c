//! In-process chunk storage backed by lock-free skip lists.

use std::{
    collections::HashMap,
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use super::{AscendingKeys, ChunkReader, ChunkStorage, ChunkWriter, Entry};
use crate::{bloom::BloomFilter, chunk::ChunkId, merge::MergeError};

type Run = Arc<SkipMap<Bytes, Bytes>>;

/// Chunk stores and bloom filters held in memory.
#[derive(Debug, Default)]
pub struct MemStorage {
    runs: Arc<Mutex<HashMap<String, Run>>>,
    blooms: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    /// An empty storage instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunk stores currently present.
    pub fn chunk_store_count(&self) -> usize {
        lock(&self.runs).len()
    }

    /// Number of bloom filters currently present.
    pub fn bloom_count(&self) -> usize {
        lock(&self.blooms).len()
    }

    fn bloom_uri(id: ChunkId) -> String {
        format!("mem:bloom-{id}")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChunkStorage for MemStorage {
    fn chunk_ref(&self, id: ChunkId) -> String {
        format!("mem:chunk-{id}")
    }

    fn create_chunk_store(
        &self,
        id: ChunkId,
    ) -> Result<(String, Box<dyn ChunkWriter>), MergeError> {
        let uri = self.chunk_ref(id);
        let run = Run::default();
        let mut runs = lock(&self.runs);
        if runs.contains_key(&uri) {
            return Err(MergeError::inconsistent(format!(
                "chunk store {uri} already exists"
            )));
        }
        runs.insert(uri.clone(), Arc::clone(&run));
        let writer = MemWriter {
            uri: uri.clone(),
            run,
            runs: Arc::clone(&self.runs),
            order: AscendingKeys::default(),
        };
        Ok((uri, Box::new(writer)))
    }

    fn open_chunk_reader(&self, data_ref: &str) -> Result<ChunkReader, MergeError> {
        let run = lock(&self.runs)
            .get(data_ref)
            .cloned()
            .ok_or_else(|| MergeError::MissingStore(data_ref.to_string()))?;
        Ok(Box::new(MemReader { run, last: None }))
    }

    fn remove_chunk_store(&self, data_ref: &str) -> Result<(), MergeError> {
        lock(&self.runs)
            .remove(data_ref)
            .map(|_| ())
            .ok_or_else(|| MergeError::MissingStore(data_ref.to_string()))
    }

    fn contains_chunk_store(&self, data_ref: &str) -> bool {
        lock(&self.runs).contains_key(data_ref)
    }

    fn put_bloom(&self, id: ChunkId, filter: &BloomFilter) -> Result<String, MergeError> {
        let uri = Self::bloom_uri(id);
        lock(&self.blooms).insert(uri.clone(), filter.to_bytes());
        Ok(uri)
    }

    fn load_bloom(&self, bloom_ref: &str) -> Result<BloomFilter, MergeError> {
        let blooms = lock(&self.blooms);
        let bytes = blooms
            .get(bloom_ref)
            .ok_or_else(|| MergeError::MissingStore(bloom_ref.to_string()))?;
        BloomFilter::from_bytes(bytes)
    }

    fn remove_bloom(&self, bloom_ref: &str) -> Result<(), MergeError> {
        lock(&self.blooms)
            .remove(bloom_ref)
            .map(|_| ())
            .ok_or_else(|| MergeError::MissingStore(bloom_ref.to_string()))
    }
}

struct MemWriter {
    uri: String,
    run: Run,
    runs: Arc<Mutex<HashMap<String, Run>>>,
    order: AscendingKeys,
}

impl ChunkWriter for MemWriter {
    fn insert(&mut self, key: Bytes, value: Bytes) -> Result<(), MergeError> {
        self.order.check(&key)?;
        self.run.insert(key, value);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<u64, MergeError> {
        Ok(self.run.len() as u64)
    }

    fn abort(self: Box<Self>) -> Result<(), MergeError> {
        lock(&self.runs).remove(&self.uri);
        Ok(())
    }
}

struct MemReader {
    run: Run,
    last: Option<Bytes>,
}

impl Iterator for MemReader {
    type Item = Result<Entry, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lower = match &self.last {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Unbounded,
        };
        let entry = self
            .run
            .range((lower, Bound::<Bytes>::Unbounded))
            .next()?;
        let pair = (entry.key().clone(), entry.value().clone());
        self.last = Some(pair.0.clone());
        Some(Ok(pair))
    }
}
