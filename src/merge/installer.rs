//! Tree installer: swaps a merge's inputs for its output under the tree lock.

use std::sync::Arc;

use crate::{
    chunk::Chunk,
    merge::{MergeError, MergePlan},
    observability::{log_info, log_warn},
    tree::{LsmTree, TreeState},
};

/// Retire `plan`'s inputs, place `output` directly behind the mutable head,
/// bump the generation, and persist.
///
/// The tree changes only if the metadata write succeeds. On any error the
/// in-memory state is exactly what it was before the call, and `output`'s
/// stores are left in place for reclamation.
pub fn install(tree: &LsmTree, plan: &MergePlan, output: Arc<Chunk>) -> Result<(), MergeError> {
    let mut state = tree.lock_state();
    let (next, start) = next_state(&state, plan, &output)?;
    let generation = next.generation;
    let retired_len = next.retired.len();
    let free_slots = next.retired.free_slot_count();

    if let Err(err) = tree.commit(&mut state, next) {
        log_warn!(
            component = "installer",
            event = "merge_install_rolled_back",
            tree = %tree.name(),
            chunk_id = %output.id(),
            generation = state.generation,
            error = %err,
        );
        return Err(err);
    }
    drop(state);

    log_info!(
        component = "installer",
        event = "merge_installed",
        tree = %tree.name(),
        chunk_id = %output.id(),
        position = start,
        span = plan.span(),
        records = output.record_count(),
        generation = generation,
        retired_slots = retired_len,
        free_slots = free_slots,
    );
    Ok(())
}

/// Build the post-install state on a copy of `state`. Returns it together
/// with the live index the output lands at.
pub(crate) fn next_state(
    state: &TreeState,
    plan: &MergePlan,
    output: &Arc<Chunk>,
) -> Result<(TreeState, usize), MergeError> {
    let inputs = plan.inputs();
    let Some(first) = inputs.first() else {
        return Err(MergeError::inconsistent("merge plan has no inputs"));
    };
    let start = state
        .live
        .iter()
        .position(|chunk| chunk.id() == first.id())
        .ok_or_else(|| {
            MergeError::inconsistent(format!("merge input {} is no longer live", first.id()))
        })?;
    if start == 0 {
        return Err(MergeError::inconsistent(format!(
            "merge input {} is the mutable head",
            first.id()
        )));
    }
    let end = start + inputs.len();
    let run = state.live.get(start..end).ok_or_else(|| {
        MergeError::inconsistent(format!(
            "live list has {} chunks, merge needs positions {start}..{end}",
            state.live.len()
        ))
    })?;
    if run
        .iter()
        .zip(inputs)
        .any(|(live, planned)| live.id() != planned.id())
    {
        return Err(MergeError::inconsistent(
            "merge inputs are no longer a contiguous live run",
        ));
    }

    let input_records: u64 = run.iter().map(|chunk| chunk.record_count()).sum();
    if input_records != plan.expected_records() {
        return Err(MergeError::inconsistent(format!(
            "merge inputs hold {input_records} records, plan expected {}",
            plan.expected_records()
        )));
    }
    if output.record_count() > plan.expected_records() {
        return Err(MergeError::inconsistent(format!(
            "merge wrote {} records from {} inputs",
            output.record_count(),
            plan.expected_records()
        )));
    }
    if !output.is_on_disk() {
        return Err(MergeError::inconsistent(format!(
            "merge output {} is not on disk",
            output.id()
        )));
    }

    let mut next = state.clone();
    let consumed: Vec<Arc<Chunk>> = next.live.drain(start..end).collect();
    next.retired.insert_all(consumed.into_iter())?;
    next.live.insert(start, Arc::clone(output));
    next.generation += 1;
    Ok((next, start))
}
