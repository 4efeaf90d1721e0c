//! Tree state: the live chunk list, the retired pool, and the generation
//! stamp, guarded by one short-hold lock.
//!
//! The lock is only ever held for bookkeeping proportional to the number of
//! chunks plus the metadata write that commits a structural change. Chunk
//! data is never read or written under it.

mod cursor;
mod metadata;
pub(crate) mod retired;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

pub use cursor::TreeCursor;
pub use metadata::{
    ChunkMeta, FileMetadataStore, MemMetadataStore, MetadataStore, TreeMetadata, TreeSnapshot,
};
use retired::RetiredPool;

use crate::{
    chunk::{Chunk, ChunkId, ChunkPin},
    context::MergeContext,
    merge::{self, MergeError, MergeOutcome, MergePlan},
    observability::{log_info, log_warn},
};

/// Guarded portion of a tree.
#[derive(Debug, Clone, Default)]
pub(crate) struct TreeState {
    /// Newest first; index 0 is the mutable head.
    pub(crate) live: Vec<Arc<Chunk>>,
    pub(crate) retired: RetiredPool<Arc<Chunk>>,
    pub(crate) generation: u64,
}

impl TreeState {
    pub(crate) fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            generation: self.generation,
            live: self.live.iter().map(|chunk| chunk.to_meta()).collect(),
            retired: self
                .retired
                .slots()
                .iter()
                .map(|slot| slot.as_ref().map(|chunk| chunk.to_meta()))
                .collect(),
            free_slot_count: self.retired.free_slot_count(),
        }
    }

    fn from_snapshot(snapshot: &TreeSnapshot) -> Self {
        Self {
            live: snapshot
                .live
                .iter()
                .map(|meta| Arc::new(Chunk::from_meta(meta)))
                .collect(),
            retired: RetiredPool::from_slots(
                snapshot
                    .retired
                    .iter()
                    .map(|slot| slot.as_ref().map(|meta| Arc::new(Chunk::from_meta(meta))))
                    .collect(),
            ),
            generation: snapshot.generation,
        }
    }

    fn validate(&self) -> Result<(), MergeError> {
        let Some(head) = self.live.first() else {
            return Err(MergeError::inconsistent("tree has no head chunk"));
        };
        if head.is_on_disk() {
            return Err(MergeError::inconsistent(format!(
                "head chunk {} is already sealed",
                head.id()
            )));
        }
        let mut seen = HashSet::new();
        let retired = self.retired.iter().map(|(_, chunk)| chunk);
        for chunk in self.live.iter().chain(retired) {
            if !seen.insert(chunk.id()) {
                return Err(MergeError::inconsistent(format!(
                    "chunk {} appears twice",
                    chunk.id()
                )));
            }
        }
        Ok(())
    }

    fn max_chunk_id(&self) -> u64 {
        let retired = self.retired.iter().map(|(_, chunk)| chunk);
        self.live
            .iter()
            .chain(retired)
            .map(|chunk| chunk.id().raw())
            .max()
            .unwrap_or(0)
    }
}

/// An LSM tree of sorted chunks.
pub struct LsmTree {
    name: String,
    ctx: Arc<MergeContext>,
    last_id: AtomicU64,
    state: Mutex<TreeState>,
}

impl LsmTree {
    /// Reopen `name` from its persisted metadata, or create it with an empty
    /// mutable head when no metadata exists.
    pub fn open(name: impl Into<String>, ctx: Arc<MergeContext>) -> Result<Self, MergeError> {
        let name = name.into();
        let Some(metadata) = ctx.metadata.read_tree_metadata(&name)? else {
            return Self::create(name, ctx);
        };
        let state = TreeState::from_snapshot(&metadata.state);
        state.validate()?;
        let last_id = metadata.last_chunk_id.max(state.max_chunk_id());
        log_info!(
            component = "tree",
            event = "tree_opened",
            tree = %name,
            live_chunks = state.live.len(),
            generation = state.generation,
        );
        Ok(Self {
            name,
            ctx,
            last_id: AtomicU64::new(last_id),
            state: Mutex::new(state),
        })
    }

    /// Create a tree holding a single empty mutable head and persist it.
    pub fn create(name: impl Into<String>, ctx: Arc<MergeContext>) -> Result<Self, MergeError> {
        let head_id = ChunkId::new(1);
        let head = Chunk::mutable(head_id, ctx.storage.chunk_ref(head_id));
        Self::from_chunks(name, ctx, vec![Arc::new(head)])
    }

    /// Build a tree over an existing live list (newest first, mutable head at
    /// index 0) and persist it.
    pub fn from_chunks(
        name: impl Into<String>,
        ctx: Arc<MergeContext>,
        live: Vec<Arc<Chunk>>,
    ) -> Result<Self, MergeError> {
        let state = TreeState {
            live,
            ..TreeState::default()
        };
        state.validate()?;
        let tree = Self {
            name: name.into(),
            ctx,
            last_id: AtomicU64::new(state.max_chunk_id()),
            state: Mutex::new(state),
        };
        {
            let state = tree.lock_state();
            tree.ctx.metadata.write_tree_metadata(&tree.metadata_of(&state))?;
        }
        Ok(tree)
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared merge context.
    pub fn context(&self) -> &Arc<MergeContext> {
        &self.ctx
    }

    /// Current generation stamp.
    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    /// Highest chunk id handed out so far.
    pub fn last_chunk_id(&self) -> ChunkId {
        ChunkId::new(self.last_id.load(Ordering::Acquire))
    }

    /// Hand out a fresh chunk id, unique within this tree.
    pub fn allocate_chunk_id(&self) -> ChunkId {
        ChunkId::new(self.last_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Hand out a fresh chunk id that has no store yet.
    ///
    /// Ids whose store outlived an install that never committed are skipped;
    /// those stores stay in place as orphans.
    pub fn allocate_vacant_chunk_id(&self) -> ChunkId {
        loop {
            let id = self.allocate_chunk_id();
            let data_ref = self.ctx.storage.chunk_ref(id);
            if !self.ctx.storage.contains_chunk_store(&data_ref) {
                return id;
            }
            log_warn!(
                component = "tree",
                event = "orphan_chunk_skipped",
                tree = %self.name,
                chunk_id = %id,
                data_ref = %data_ref,
            );
        }
    }

    /// Live chunks, newest first.
    pub fn live_chunks(&self) -> Vec<Arc<Chunk>> {
        self.lock_state().live.clone()
    }

    /// Copy of the tree shape.
    pub fn snapshot(&self) -> TreeSnapshot {
        self.lock_state().snapshot()
    }

    /// The document that [`MetadataStore::write_tree_metadata`] would receive now.
    pub fn metadata(&self) -> TreeMetadata {
        let state = self.lock_state();
        self.metadata_of(&state)
    }

    /// Install a fresh mutable head in front of the current one.
    ///
    /// The previous head keeps its position at index 1 until the flush path
    /// marks it on disk; it is not merge eligible before that.
    pub fn switch_head(&self) -> Result<Arc<Chunk>, MergeError> {
        let id = self.allocate_vacant_chunk_id();
        let head = Arc::new(Chunk::mutable(id, self.ctx.storage.chunk_ref(id)));
        let mut state = self.lock_state();
        let mut next = state.clone();
        next.live.insert(0, Arc::clone(&head));
        next.generation += 1;
        self.commit(&mut state, next)?;
        Ok(head)
    }

    /// Open a read cursor over the current live chunks, pinning each of them.
    pub fn open_cursor(&self) -> TreeCursor {
        let state = self.lock_state();
        let pins = state
            .live
            .iter()
            .map(|chunk| ChunkPin::new(Arc::clone(chunk)))
            .collect();
        TreeCursor::new(Arc::clone(&self.ctx), state.generation, pins)
    }

    /// Select the next merge, if any chunks are eligible.
    pub fn plan_merge(&self) -> Option<MergePlan> {
        let state = self.lock_state();
        merge::planner::select(&state, self.ctx.option.max_span())
    }

    /// Plan, execute, and install one major merge.
    pub fn attempt_major_merge(&self) -> Result<MergeOutcome, MergeError> {
        merge::attempt_major_merge(self)
    }

    /// Delete the stores of retired chunks that no reader holds any more
    /// and vacate their slots. Returns how many chunks were reclaimed.
    ///
    /// A chunk whose stores cannot be deleted keeps its slot, so a later call
    /// retries it. The first such error is returned after every other idle
    /// chunk has been reclaimed and committed.
    pub fn reclaim_retired(&self) -> Result<usize, MergeError> {
        let idle: Vec<(usize, Arc<Chunk>)> = self
            .lock_state()
            .retired
            .iter()
            .filter(|(_, chunk)| chunk.active_readers() == 0)
            .map(|(slot, chunk)| (slot, Arc::clone(chunk)))
            .collect();
        if idle.is_empty() {
            return Ok(0);
        }

        let storage = &self.ctx.storage;
        let mut deleted = Vec::with_capacity(idle.len());
        let mut first_err = None;
        for (slot, chunk) in idle {
            let removed = already_gone(storage.remove_chunk_store(chunk.data_ref())).and_then(|()| {
                chunk
                    .bloom_ref()
                    .map_or(Ok(()), |bloom_ref| already_gone(storage.remove_bloom(bloom_ref)))
            });
            match removed {
                Ok(()) => deleted.push((slot, chunk.id())),
                Err(err) => {
                    log_warn!(
                        component = "tree",
                        event = "retired_reclaim_failed",
                        tree = %self.name,
                        chunk_id = %chunk.id(),
                        error = %err,
                    );
                    first_err.get_or_insert(err);
                }
            }
        }

        if !deleted.is_empty() {
            let mut state = self.lock_state();
            let mut next = state.clone();
            for (slot, id) in &deleted {
                let held = next.retired.slots().get(*slot).and_then(Option::as_ref);
                if held.is_some_and(|chunk| chunk.id() == *id) {
                    next.retired.remove(*slot);
                }
            }
            self.commit(&mut state, next)?;
        }
        log_info!(
            component = "tree",
            event = "retired_reclaimed",
            tree = %self.name,
            chunks = deleted.len(),
        );
        match first_err {
            Some(err) => Err(err),
            None => Ok(deleted.len()),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn metadata_of(&self, state: &TreeState) -> TreeMetadata {
        TreeMetadata {
            name: self.name.clone(),
            last_chunk_id: self.last_id.load(Ordering::Acquire),
            state: state.snapshot(),
        }
    }

    /// Persist `next` and make it the current state. On failure the current
    /// state is left exactly as it was.
    pub(crate) fn commit(
        &self,
        state: &mut MutexGuard<'_, TreeState>,
        next: TreeState,
    ) -> Result<(), MergeError> {
        self.ctx
            .metadata
            .write_tree_metadata(&self.metadata_of(&next))?;
        **state = next;
        Ok(())
    }
}

fn already_gone(result: Result<(), MergeError>) -> Result<(), MergeError> {
    match result {
        Err(MergeError::MissingStore(_)) => Ok(()),
        other => other,
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("name", &self.name)
            .field("last_id", &self.last_id.load(Ordering::Acquire))
            .field("state", &*self.lock_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::LsmTree;
    use crate::{
        chunk::{Chunk, ChunkId},
        context::MergeContext,
        option::MergeOptions,
    };

    fn ctx() -> Arc<MergeContext> {
        Arc::new(MergeContext::in_memory(MergeOptions::default()))
    }

    #[test]
    fn open_creates_and_then_recovers() {
        let ctx = ctx();
        let tree = LsmTree::open("t", Arc::clone(&ctx)).expect("create");
        assert_eq!(tree.live_chunks().len(), 1);
        let head = tree.switch_head().expect("switch");
        assert_eq!(head.id(), ChunkId::new(2));
        assert_eq!(tree.generation(), 1);

        let reopened = LsmTree::open("t", ctx).expect("reopen");
        assert_eq!(reopened.snapshot(), tree.snapshot());
        assert_eq!(reopened.last_chunk_id(), ChunkId::new(2));
        assert_eq!(reopened.allocate_chunk_id(), ChunkId::new(3));
    }

    #[test]
    fn sealed_head_is_rejected() {
        let sealed = Arc::new(Chunk::sealed(ChunkId::new(1), "x", None, 1));
        assert!(LsmTree::from_chunks("t", ctx(), vec![sealed]).is_err());
        assert!(LsmTree::from_chunks("t", ctx(), Vec::new()).is_err());
    }

    #[test]
    fn duplicate_chunk_ids_are_rejected() {
        let head = Arc::new(Chunk::mutable(ChunkId::new(2), "h"));
        let a = Arc::new(Chunk::sealed(ChunkId::new(1), "a", None, 1));
        let b = Arc::new(Chunk::sealed(ChunkId::new(1), "b", None, 1));
        assert!(LsmTree::from_chunks("t", ctx(), vec![head, a, b]).is_err());
    }

    #[test]
    fn cursors_pin_and_release_live_chunks() {
        let tree = LsmTree::open("t", ctx()).expect("create");
        let cursor = tree.open_cursor();
        assert!(tree.live_chunks().iter().all(|c| c.active_readers() == 1));
        drop(cursor);
        assert!(tree.live_chunks().iter().all(|c| c.active_readers() == 0));
    }
}
