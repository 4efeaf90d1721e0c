//! Merge executor: streams the planned inputs into one new chunk.
//!
//! Runs without the tree lock. The only shared state it touches is the
//! tree's chunk id counter and, around store creation, the schema lock.

use std::sync::Arc;

use crate::{
    bloom::BloomBuilder,
    chunk::{Chunk, ChunkId},
    merge::{cursor::MergeCursor, MergeError, MergePlan},
    observability::{log_debug, log_info, log_warn},
    storage::{ChunkStorage, ChunkWriter},
    tree::LsmTree,
};

/// Write the merged contents of `plan`'s inputs into a fresh chunk.
///
/// On failure every partial output (data store and bloom filter) is
/// discarded and the tree is left untouched.
pub fn execute(tree: &LsmTree, plan: &MergePlan) -> Result<Arc<Chunk>, MergeError> {
    let ctx = tree.context();
    let option = ctx.option();
    let storage = ctx.storage().as_ref();

    let (id, data_ref, mut writer) = ctx.with_schema_lock(|| create_output_store(tree, storage))?;
    let mut bloom = if option.bloom_enabled {
        BloomBuilder::create(
            id,
            plan.expected_records(),
            option.bloom_bits_per_key,
            option.bloom_hash_count,
        )
    } else {
        None
    };

    log_info!(
        component = "executor",
        event = "merge_started",
        tree = %tree.name(),
        chunk_id = %id,
        span = plan.span(),
        expected_records = plan.expected_records(),
        bloom = bloom.is_some(),
    );

    let written = match stream(storage, plan, &mut *writer, bloom.as_mut()) {
        Ok(written) => written,
        Err(err) => {
            if let Some(bloom) = bloom {
                bloom.discard();
            }
            if let Err(abort_err) = writer.abort() {
                warn_cleanup(id, &data_ref, &abort_err);
            }
            return Err(err);
        }
    };

    let finished = match writer.finish() {
        Ok(finished) => finished,
        Err(err) => {
            discard_output(storage, id, &data_ref);
            return Err(err);
        }
    };
    if finished != written {
        discard_output(storage, id, &data_ref);
        return Err(MergeError::inconsistent(format!(
            "chunk {id} holds {finished} records, {written} were written"
        )));
    }

    let bloom_ref = match bloom {
        Some(bloom) => {
            log_debug!(
                component = "executor",
                event = "merge_bloom_summary",
                chunk_id = %id,
                expected_records = bloom.expected_records(),
                inserted = bloom.inserted(),
            );
            match bloom.finalize(storage) {
                Ok(bloom_ref) => Some(bloom_ref),
                Err(err) => {
                    discard_output(storage, id, &data_ref);
                    return Err(err);
                }
            }
        }
        None => None,
    };

    Ok(Arc::new(Chunk::sealed(id, data_ref, bloom_ref, written)))
}

fn create_output_store(
    tree: &LsmTree,
    storage: &dyn ChunkStorage,
) -> Result<(ChunkId, String, Box<dyn ChunkWriter>), MergeError> {
    let id = tree.allocate_vacant_chunk_id();
    let (data_ref, writer) = storage.create_chunk_store(id)?;
    Ok((id, data_ref, writer))
}

fn stream(
    storage: &dyn ChunkStorage,
    plan: &MergePlan,
    writer: &mut dyn ChunkWriter,
    mut bloom: Option<&mut BloomBuilder>,
) -> Result<u64, MergeError> {
    let cursor = MergeCursor::open(storage, plan.inputs())?;
    let mut inserted = 0u64;
    for entry in cursor {
        let (key, value) = entry?;
        if let Some(bloom) = bloom.as_deref_mut() {
            bloom.insert(&key);
        }
        writer.insert(key, value)?;
        inserted += 1;
    }
    Ok(inserted)
}

fn discard_output(storage: &dyn ChunkStorage, id: ChunkId, data_ref: &str) {
    if let Err(err) = storage.remove_chunk_store(data_ref) {
        warn_cleanup(id, data_ref, &err);
    }
}

fn warn_cleanup(id: ChunkId, data_ref: &str, err: &MergeError) {
    log_warn!(
        component = "executor",
        event = "merge_output_discard_failed",
        chunk_id = %id,
        data_ref = %data_ref,
        error = %err,
    );
}
