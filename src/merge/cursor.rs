//! Merge cursor: the ordered, deduplicated view a merge reads its inputs
//! through.

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc};

use bytes::Bytes;

use crate::{
    chunk::{Chunk, ChunkPin},
    merge::MergeError,
    storage::{ChunkReader, ChunkStorage, Entry},
};

/// Ascending k-way merge over a run of chunks ordered newest first.
///
/// When several chunks hold the same key, the entry from the newest chunk
/// wins and the older ones are skipped. Every input stays pinned until the
/// cursor is dropped.
pub struct MergeCursor {
    readers: Vec<ChunkReader>,
    peeked: BinaryHeap<CmpEntry>,
    last_key: Option<Bytes>,
    done: bool,
    _pins: Vec<ChunkPin>,
}

impl MergeCursor {
    /// Pin `chunks` (newest first) and open a merge over them.
    pub fn open(storage: &dyn ChunkStorage, chunks: &[Arc<Chunk>]) -> Result<Self, MergeError> {
        let pins = chunks
            .iter()
            .map(|chunk| ChunkPin::new(Arc::clone(chunk)))
            .collect();
        Self::new(storage, pins)
    }

    /// Open a reader on every pinned chunk; `pins[0]` is the newest.
    pub fn new(storage: &dyn ChunkStorage, pins: Vec<ChunkPin>) -> Result<Self, MergeError> {
        let mut readers = Vec::with_capacity(pins.len());
        let mut peeked = BinaryHeap::with_capacity(pins.len());
        for (offset, pin) in pins.iter().enumerate() {
            let mut reader = storage.open_chunk_reader(pin.data_ref())?;
            if let Some(entry) = reader.next() {
                peeked.push(CmpEntry::new(offset, entry?));
            }
            readers.push(reader);
        }
        Ok(Self {
            readers,
            peeked,
            last_key: None,
            done: false,
            _pins: pins,
        })
    }

    fn advance(&mut self) -> Result<Option<Entry>, MergeError> {
        while let Some(peeked) = self.peeked.pop() {
            if let Some(next) = self.readers[peeked.offset].next() {
                self.peeked.push(CmpEntry::new(peeked.offset, next?));
            }
            if self.last_key.as_ref() == Some(&peeked.key) {
                continue;
            }
            self.last_key = Some(peeked.key.clone());
            return Ok(Some((peeked.key, peeked.value)));
        }
        Ok(None)
    }
}

impl Iterator for MergeCursor {
    type Item = Result<Entry, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for MergeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCursor")
            .field("inputs", &self.readers.len())
            .field("last_key", &self.last_key)
            .field("done", &self.done)
            .finish()
    }
}

#[derive(Debug)]
struct CmpEntry {
    offset: usize,
    key: Bytes,
    value: Bytes,
}

impl CmpEntry {
    fn new(offset: usize, (key, value): Entry) -> Self {
        Self { offset, key, value }
    }
}

impl PartialEq for CmpEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CmpEntry {}

impl PartialOrd for CmpEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CmpEntry {
    // reversed: the max-heap yields the smallest key, newest chunk first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.offset.cmp(&self.offset))
    }
}
