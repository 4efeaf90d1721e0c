mod common;

use std::{collections::HashSet, sync::Arc, thread};

use bytes::Bytes;
use common::{
    flush_head, partition, random_keys, tree_with_runs, value_for, FailingMetadataStore,
    FailingStorage,
};
use lsm_merge::{
    merge, ChunkId, ChunkPin, ChunkStorage, FileMetadataStore, LocalStorage, LsmTree,
    MemMetadataStore, MemStorage, MergeContext, MergeError, MergeOptions, MergeOutcome,
    MetadataStore,
};

fn mem_context(option: MergeOptions) -> (Arc<MemStorage>, Arc<MergeContext>) {
    let storage = Arc::new(MemStorage::new());
    let ctx = MergeContext::new(
        Arc::clone(&storage) as Arc<dyn ChunkStorage>,
        Arc::new(MemMetadataStore::new()),
        option,
    );
    (storage, Arc::new(ctx))
}

#[test]
fn short_tree_is_left_untouched() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let mut rng = fastrand::Rng::with_seed(1);
    let runs = vec![random_keys(&mut rng, 10)];
    let tree = tree_with_runs(Arc::clone(&ctx), "short", &runs);
    let before = tree.metadata();

    assert_eq!(tree.attempt_major_merge().unwrap(), MergeOutcome::NoWorkAvailable);
    assert_eq!(tree.metadata(), before);
    assert_eq!(ctx.metadata().read_tree_metadata("short").unwrap(), Some(before));

    let empty = LsmTree::open("empty", Arc::clone(&ctx)).unwrap();
    assert_eq!(empty.attempt_major_merge().unwrap(), MergeOutcome::NoWorkAvailable);
    assert_eq!(empty.generation(), 0);
    assert_eq!(ctx.metrics().snapshot().no_work, 2);
}

#[test]
fn merge_conserves_records() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let mut rng = fastrand::Rng::with_seed(2);
    let keys = random_keys(&mut rng, 354);
    let runs = partition(&mut rng, keys.clone(), &[100, 250, 4]);
    let tree = tree_with_runs(Arc::clone(&ctx), "conserve", &runs);
    let head = tree.live_chunks()[0].id();

    let outcome = tree.attempt_major_merge().unwrap();
    let MergeOutcome::Merged {
        chunk_id,
        chunks_consumed,
        records_written,
    } = outcome
    else {
        panic!("expected a merge, got {outcome:?}");
    };
    assert_eq!(chunks_consumed, 3);
    assert_eq!(records_written, 354);

    let snapshot = tree.snapshot();
    let live: Vec<ChunkId> = snapshot.live.iter().map(|meta| meta.id).collect();
    assert_eq!(live, [head, chunk_id]);
    assert_eq!(snapshot.live[1].record_count, 354);
    assert_eq!(snapshot.retired_records(), 354);
    assert_eq!(snapshot.generation, 1);

    let cursor = tree.open_cursor();
    let merged: Vec<Bytes> = cursor.scan().unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(merged, keys);
}

#[test]
fn overlapping_keys_keep_the_newest_value() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let shared = Bytes::from_static(b"shared");
    let runs = vec![
        vec![Bytes::from_static(b"a"), shared.clone()],
        vec![shared.clone(), Bytes::from_static(b"z")],
    ];
    let tree = tree_with_runs(ctx, "overlap", &runs);

    let outcome = tree.attempt_major_merge().unwrap();
    assert!(matches!(
        outcome,
        MergeOutcome::Merged {
            records_written: 3,
            ..
        }
    ));
    let cursor = tree.open_cursor();
    // runs[0] is the newest chunk, id 2
    assert_eq!(
        cursor.get(&shared).unwrap(),
        Some(value_for(&shared, ChunkId::new(2)))
    );
}

#[test]
fn pinned_chunks_are_never_selected() {
    let (_, ctx) = mem_context(MergeOptions::default().handle_budget(6));
    let mut rng = fastrand::Rng::with_seed(3);
    let keys = random_keys(&mut rng, 30);
    let runs = partition(&mut rng, keys, &[10, 10, 10]);
    let tree = tree_with_runs(ctx, "pinned", &runs);
    let before = tree.snapshot();

    // [head, A, B, C] with two readers on B
    let b = Arc::clone(&tree.live_chunks()[2]);
    let pins = [ChunkPin::new(Arc::clone(&b)), ChunkPin::new(Arc::clone(&b))];
    assert_eq!(tree.attempt_major_merge().unwrap(), MergeOutcome::NoWorkAvailable);
    assert_eq!(tree.snapshot(), before);

    drop(pins);
    assert!(matches!(
        tree.attempt_major_merge().unwrap(),
        MergeOutcome::Merged {
            chunks_consumed: 3,
            ..
        }
    ));
}

#[test]
fn generation_moves_once_per_install() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let tree = LsmTree::open("gen", ctx).unwrap();
    let mut rng = fastrand::Rng::with_seed(4);

    for _ in 0..3 {
        flush_head(&tree, &random_keys(&mut rng, 20));
    }
    let before = tree.generation();
    assert_eq!(before, 3);

    tree.attempt_major_merge().unwrap();
    assert_eq!(tree.generation(), before + 1);
    assert_eq!(tree.attempt_major_merge().unwrap(), MergeOutcome::NoWorkAvailable);
    assert_eq!(tree.generation(), before + 1);

    flush_head(&tree, &random_keys(&mut rng, 20));
    tree.attempt_major_merge().unwrap();
    assert_eq!(tree.generation(), before + 3);
}

#[test]
fn every_merged_key_passes_the_bloom_filter() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let mut rng = fastrand::Rng::with_seed(5);
    let keys = random_keys(&mut rng, 500);
    let runs = partition(&mut rng, keys.clone(), &[200, 200, 100]);
    let tree = tree_with_runs(Arc::clone(&ctx), "bloom", &runs);

    tree.attempt_major_merge().unwrap();
    let merged = Arc::clone(&tree.live_chunks()[1]);
    let bloom_ref = merged.bloom_ref().expect("bloom filter");
    let filter = ctx.storage().load_bloom(bloom_ref).unwrap();
    for key in &keys {
        assert!(filter.may_contain(key));
    }

    let cursor = tree.open_cursor();
    for key in keys.iter().step_by(37) {
        assert!(cursor.get(key).unwrap().is_some());
    }
}

#[test]
fn empty_merge_has_no_bloom_filter() {
    let (storage, ctx) = mem_context(MergeOptions::default());
    let tree = tree_with_runs(ctx, "empty", &[Vec::new(), Vec::new()]);

    assert!(matches!(
        tree.attempt_major_merge().unwrap(),
        MergeOutcome::Merged {
            records_written: 0,
            ..
        }
    ));
    assert!(tree.live_chunks()[1].bloom_ref().is_none());
    assert_eq!(storage.bloom_count(), 0);
}

#[test]
fn concurrent_allocations_never_collide() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let tree = LsmTree::open("ids", ctx).unwrap();

    let tree = &tree;
    let ids: Vec<ChunkId> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(move || {
                    (0..500)
                        .map(|_| tree.allocate_chunk_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });
    let distinct: HashSet<ChunkId> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), ids.len());
    assert_eq!(tree.last_chunk_id(), ChunkId::new(1 + 8 * 500));
}

#[test]
fn racing_merges_get_distinct_outputs_and_one_install() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let mut rng = fastrand::Rng::with_seed(6);
    let keys = random_keys(&mut rng, 40);
    let runs = partition(&mut rng, keys, &[20, 20]);
    let tree = tree_with_runs(ctx, "race", &runs);
    let plan = tree.plan_merge().expect("plan");

    let outputs = thread::scope(|scope| {
        let first = scope.spawn(|| merge::execute(&tree, &plan));
        let second = scope.spawn(|| merge::execute(&tree, &plan));
        [first.join().unwrap().unwrap(), second.join().unwrap().unwrap()]
    });
    assert_ne!(outputs[0].id(), outputs[1].id());

    let [winner, loser] = outputs;
    merge::install(&tree, &plan, winner).unwrap();
    let err = merge::install(&tree, &plan, loser).unwrap_err();
    assert!(matches!(err, MergeError::InconsistentState(_)));
    assert_eq!(tree.generation(), 1);
}

#[test]
fn failed_commit_restores_the_pre_image_and_orphans_the_output() {
    let storage = Arc::new(MemStorage::new());
    let metadata = Arc::new(FailingMetadataStore::default());
    let ctx = Arc::new(MergeContext::new(
        Arc::clone(&storage) as Arc<dyn ChunkStorage>,
        Arc::clone(&metadata) as Arc<dyn MetadataStore>,
        MergeOptions::default(),
    ));
    let mut rng = fastrand::Rng::with_seed(7);
    let keys = random_keys(&mut rng, 60);
    let runs = partition(&mut rng, keys, &[20, 20, 20]);
    let tree = tree_with_runs(ctx, "crash", &runs);
    let before = tree.snapshot();
    let persisted = metadata.read_tree_metadata("crash").unwrap();
    let stores = storage.chunk_store_count();

    metadata.set_failing(true);
    let err = tree.attempt_major_merge().unwrap_err();
    assert!(err.is_io());
    assert_eq!(tree.snapshot(), before);
    assert_eq!(metadata.read_tree_metadata("crash").unwrap(), persisted);

    let orphan = storage.chunk_ref(tree.last_chunk_id());
    assert!(storage.contains_chunk_store(&orphan));
    assert_eq!(storage.chunk_store_count(), stores + 1);
    assert_eq!(tree.context().metrics().snapshot().failures, 1);

    metadata.set_failing(false);
    assert!(matches!(
        tree.attempt_major_merge().unwrap(),
        MergeOutcome::Merged { .. }
    ));
    assert_eq!(tree.generation(), before.generation + 1);
}

#[test]
fn failed_bloom_finalize_discards_the_output() {
    let storage = Arc::new(FailingStorage::new(Arc::new(MemStorage::new())));
    let ctx = Arc::new(MergeContext::new(
        Arc::clone(&storage) as Arc<dyn ChunkStorage>,
        Arc::new(MemMetadataStore::new()),
        MergeOptions::default(),
    ));
    let mut rng = fastrand::Rng::with_seed(8);
    let keys = random_keys(&mut rng, 30);
    let runs = partition(&mut rng, keys, &[15, 15]);
    let tree = tree_with_runs(ctx, "bloom-fail", &runs);
    let before = tree.snapshot();

    storage.set_failing_bloom(true);
    assert!(tree.attempt_major_merge().unwrap_err().is_io());
    assert_eq!(tree.snapshot(), before);
    let output = storage.chunk_ref(tree.last_chunk_id());
    assert!(!storage.contains_chunk_store(&output));
}

#[test]
fn reopen_after_failed_install_steps_past_the_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(12);
    let keys = random_keys(&mut rng, 90);
    let runs = partition(&mut rng, keys, &[30, 30, 30]);

    let orphan = {
        let storage: Arc<dyn ChunkStorage> =
            Arc::new(LocalStorage::new(dir.path().join("chunks")).unwrap());
        let metadata = Arc::new(FailingMetadataStore::new(Arc::new(
            FileMetadataStore::new(dir.path()).unwrap(),
        )));
        let ctx = Arc::new(MergeContext::new(
            Arc::clone(&storage),
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            MergeOptions::default(),
        ));
        let tree = LsmTree::open("crash", ctx).unwrap();
        for run in &runs {
            flush_head(&tree, run);
        }

        metadata.set_failing(true);
        assert!(tree.attempt_major_merge().unwrap_err().is_io());
        let orphan = storage.chunk_ref(tree.last_chunk_id());
        assert!(storage.contains_chunk_store(&orphan));
        orphan
    };

    let ctx = Arc::new(MergeContext::local(dir.path(), MergeOptions::default()).unwrap());
    let tree = LsmTree::open("crash", Arc::clone(&ctx)).unwrap();
    assert_eq!(tree.last_chunk_id(), ChunkId::new(4));

    let outcome = tree.attempt_major_merge().unwrap();
    let MergeOutcome::Merged {
        chunk_id,
        records_written,
        ..
    } = outcome
    else {
        panic!("expected a merge, got {outcome:?}");
    };
    assert_eq!(chunk_id, ChunkId::new(6));
    assert_eq!(records_written, 90);
    assert!(ctx.storage().contains_chunk_store(&orphan));

    // the new head comes after the merged chunk
    let head = flush_head(&tree, &random_keys(&mut rng, 5));
    assert_eq!(head.id(), ChunkId::new(4));
    assert_eq!(tree.live_chunks()[0].id(), ChunkId::new(7));

    let reopened = LsmTree::open("crash", ctx).unwrap();
    assert_eq!(reopened.snapshot(), tree.snapshot());
    assert_eq!(reopened.last_chunk_id(), ChunkId::new(7));
}

#[test]
fn failed_deletes_stay_retired_until_retried() {
    let mem = Arc::new(MemStorage::new());
    let storage = Arc::new(FailingStorage::new(
        Arc::clone(&mem) as Arc<dyn ChunkStorage>
    ));
    let ctx = Arc::new(MergeContext::new(
        Arc::clone(&storage) as Arc<dyn ChunkStorage>,
        Arc::new(MemMetadataStore::new()),
        MergeOptions::default(),
    ));
    let mut rng = fastrand::Rng::with_seed(13);
    let keys = random_keys(&mut rng, 30);
    let runs = partition(&mut rng, keys, &[10, 10, 10]);
    let tree = tree_with_runs(ctx, "leak", &runs);
    tree.attempt_major_merge().unwrap();
    assert_eq!(mem.chunk_store_count(), 4);

    storage.set_failing_remove(true);
    assert!(tree.reclaim_retired().unwrap_err().is_io());
    assert_eq!(tree.snapshot().retired.iter().flatten().count(), 3);
    assert_eq!(mem.chunk_store_count(), 4);

    storage.set_failing_remove(false);
    assert_eq!(tree.reclaim_retired().unwrap(), 3);
    assert_eq!(tree.snapshot().retired.iter().flatten().count(), 0);
    assert_eq!(mem.chunk_store_count(), 1);
}

#[test]
fn reclaimed_slots_are_reused() {
    let (storage, ctx) = mem_context(MergeOptions::default());
    let tree = LsmTree::open("slots", ctx).unwrap();
    let mut rng = fastrand::Rng::with_seed(9);
    for _ in 0..3 {
        flush_head(&tree, &random_keys(&mut rng, 5));
    }
    tree.attempt_major_merge().unwrap();

    let snapshot = tree.snapshot();
    assert_eq!(snapshot.retired.len(), 10);
    assert_eq!(snapshot.free_slot_count, 7);

    let stores = storage.chunk_store_count();
    assert_eq!(tree.reclaim_retired().unwrap(), 3);
    assert_eq!(storage.chunk_store_count(), stores - 3);
    let snapshot = tree.snapshot();
    assert_eq!(snapshot.retired.len(), 10);
    assert_eq!(snapshot.free_slot_count, 10);

    // [head, flushed, merged]
    flush_head(&tree, &random_keys(&mut rng, 5));
    tree.attempt_major_merge().unwrap();
    let snapshot = tree.snapshot();
    assert_eq!(snapshot.retired.len(), 10);
    assert_eq!(snapshot.free_slot_count, 8);
}

#[test]
fn pinned_retired_chunks_survive_reclamation() {
    let (_, ctx) = mem_context(MergeOptions::default());
    let mut rng = fastrand::Rng::with_seed(10);
    let keys = random_keys(&mut rng, 20);
    let runs = partition(&mut rng, keys, &[10, 10]);
    let tree = tree_with_runs(ctx, "survive", &runs);
    let oldest = Arc::clone(&tree.live_chunks()[2]);

    tree.attempt_major_merge().unwrap();
    let pin = ChunkPin::new(oldest);
    assert_eq!(tree.reclaim_retired().unwrap(), 1);
    drop(pin);
    assert_eq!(tree.reclaim_retired().unwrap(), 1);
    assert_eq!(tree.reclaim_retired().unwrap(), 0);
}

#[test]
fn local_tree_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(11);
    let keys = random_keys(&mut rng, 300);
    let runs = partition(&mut rng, keys.clone(), &[100, 100, 100]);

    {
        let ctx = Arc::new(MergeContext::local(dir.path(), MergeOptions::default()).unwrap());
        let tree = LsmTree::open("disk", ctx).unwrap();
        for run in &runs {
            flush_head(&tree, run);
        }
        assert!(matches!(
            tree.attempt_major_merge().unwrap(),
            MergeOutcome::Merged {
                chunks_consumed: 3,
                records_written: 300,
                ..
            }
        ));
    }

    let ctx = Arc::new(MergeContext::local(dir.path(), MergeOptions::default()).unwrap());
    let tree = LsmTree::open("disk", Arc::clone(&ctx)).unwrap();
    let snapshot = tree.snapshot();
    assert_eq!(snapshot.generation, 4);
    assert_eq!(snapshot.live.len(), 2);
    assert_eq!(snapshot.live_records(), 300);
    assert_eq!(tree.last_chunk_id(), ChunkId::new(5));

    let cursor = tree.open_cursor();
    for key in keys.iter().step_by(29) {
        assert!(cursor.get(key).unwrap().is_some());
    }
    drop(cursor);

    assert_eq!(tree.reclaim_retired().unwrap(), 3);
    let chunk_files = std::fs::read_dir(dir.path().join("chunks")).unwrap().count();
    // merged data file and its bloom filter
    assert_eq!(chunk_files, 2);

    let reopened = LsmTree::open("disk", ctx).unwrap();
    assert_eq!(reopened.snapshot(), tree.snapshot());
}

#[test]
fn merges_on_sibling_trees_run_concurrently() {
    let trees: Vec<LsmTree> = (0..4)
        .map(|idx| {
            let (_, ctx) = mem_context(MergeOptions::default());
            let mut rng = fastrand::Rng::with_seed(100 + idx);
            let keys = random_keys(&mut rng, 30);
            let runs = partition(&mut rng, keys, &[10, 10, 10]);
            let tree = LsmTree::open(format!("sibling-{idx}"), ctx).unwrap();
            for run in &runs {
                flush_head(&tree, run);
            }
            tree
        })
        .collect();

    let outcomes: Vec<MergeOutcome> = thread::scope(|scope| {
        let handles: Vec<_> = trees
            .iter()
            .map(|tree| scope.spawn(move || tree.attempt_major_merge().unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for (tree, outcome) in trees.iter().zip(outcomes) {
        assert!(matches!(
            outcome,
            MergeOutcome::Merged {
                records_written: 30,
                ..
            }
        ));
        assert_eq!(tree.context().metrics().snapshot().merges, 1);
    }
}
