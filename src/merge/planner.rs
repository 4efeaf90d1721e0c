//! Major-merge planner: decides how many sealed chunks behind the mutable
//! head the next merge consumes.

use std::sync::Arc;

use crate::{chunk::Chunk, tree::TreeState};

/// Inputs of one major merge, captured under the tree lock.
///
/// The plan covers live positions `[1..=span]`. The merge itself runs
/// against this snapshot without holding the lock.
#[derive(Debug, Clone)]
pub struct MergePlan {
    span: usize,
    expected_records: u64,
    inputs: Vec<Arc<Chunk>>,
    generation: u64,
}

impl MergePlan {
    /// Number of chunks the merge consumes.
    pub fn span(&self) -> usize {
        self.span
    }

    /// Sum of the inputs' record counts at planning time.
    pub fn expected_records(&self) -> u64 {
        self.expected_records
    }

    /// Input chunks, newest first.
    pub fn inputs(&self) -> &[Arc<Chunk>] {
        &self.inputs
    }

    /// Tree generation the plan was taken at.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Pick the merge span for `state`, or `None` when fewer than two chunks
/// are eligible.
///
/// The span starts at `min(max_span, live.len() - 1)` and shrinks until every
/// chunk in `[1..=span]` is on disk and unpinned.
pub(crate) fn select(state: &TreeState, max_span: usize) -> Option<MergePlan> {
    let live = &state.live;
    let mut candidate = live.len().saturating_sub(1);
    if candidate <= 1 {
        return None;
    }
    candidate = candidate.min(max_span);
    if candidate <= 1 {
        return None;
    }
    if let Some(blocked) = live[1..=candidate]
        .iter()
        .position(|chunk| !chunk.is_merge_eligible())
    {
        // position is relative to index 1
        candidate = blocked;
    }
    if candidate <= 1 {
        return None;
    }

    let inputs = live[1..=candidate].to_vec();
    let expected_records = inputs.iter().map(|chunk| chunk.record_count()).sum();
    Some(MergePlan {
        span: candidate,
        expected_records,
        inputs,
        generation: state.generation,
    })
}
