use std::sync::Arc;

use bytes::Bytes;

use crate::{
    chunk::{ChunkId, ChunkPin},
    context::MergeContext,
    merge::{MergeCursor, MergeError},
    tree::LsmTree,
};

/// Read view over a tree's live chunks as of one generation.
///
/// Every chunk in the view stays pinned, so none of them can be picked by a
/// merge planned while the cursor is open. A cursor never notices structural
/// changes on its own; readers compare [`TreeCursor::generation`] with the
/// tree's and [`TreeCursor::reopen`] when it moved.
#[derive(Debug)]
pub struct TreeCursor {
    ctx: Arc<MergeContext>,
    generation: u64,
    chunks: Vec<ChunkPin>,
}

impl TreeCursor {
    pub(crate) fn new(ctx: Arc<MergeContext>, generation: u64, chunks: Vec<ChunkPin>) -> Self {
        Self {
            ctx,
            generation,
            chunks,
        }
    }

    /// Generation the view was taken at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ids of the chunks in view, newest first.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.iter().map(|chunk| chunk.id()).collect()
    }

    /// Whether `tree` has been restructured since the view was taken.
    pub fn is_stale(&self, tree: &LsmTree) -> bool {
        tree.generation() != self.generation
    }

    /// Replace the view with the tree's current shape.
    pub fn reopen(&mut self, tree: &LsmTree) {
        *self = tree.open_cursor();
    }

    /// Newest value stored for `key` in the durable chunks of the view.
    ///
    /// Chunks still being written are skipped; their contents belong to the
    /// write path.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, MergeError> {
        let storage = self.ctx.storage().as_ref();
        for chunk in self.chunks.iter().filter(|chunk| chunk.is_on_disk()) {
            if let Some(bloom) = chunk.bloom(storage)? {
                if !bloom.may_contain(key) {
                    continue;
                }
            }
            for entry in storage.open_chunk_reader(chunk.data_ref())? {
                let (found, value) = entry?;
                match found[..].cmp(key) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => return Ok(Some(value)),
                    std::cmp::Ordering::Greater => break,
                }
            }
        }
        Ok(None)
    }

    /// Ordered scan of the durable chunks in view, newest value per key.
    pub fn scan(&self) -> Result<MergeCursor, MergeError> {
        let pins = self
            .chunks
            .iter()
            .filter(|chunk| chunk.is_on_disk())
            .cloned()
            .collect();
        MergeCursor::new(self.ctx.storage().as_ref(), pins)
    }
}
