#![deny(missing_docs)]
//! Major-merge engine for an LSM tree of sorted chunks.
//!
//! A tree keeps its chunks newest first: a mutable head filled by the write
//! path, followed by sealed, durable chunks. A major merge folds a prefix of
//! the sealed chunks into a single new chunk with a bloom filter, retires the
//! inputs, and commits the new shape through the tree's metadata store.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lsm_merge::{LsmTree, MergeContext, MergeOptions, MergeOutcome};
//!
//! # fn main() -> Result<(), lsm_merge::MergeError> {
//! let ctx = Arc::new(MergeContext::local("/var/lib/app", MergeOptions::default())?);
//! let tree = LsmTree::open("events", ctx)?;
//! match tree.attempt_major_merge()? {
//!     MergeOutcome::Merged { records_written, .. } => println!("merged {records_written}"),
//!     MergeOutcome::NoWorkAvailable => {}
//! }
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod chunk;
mod context;
pub mod merge;
mod observability;
mod option;
pub mod storage;
pub mod tree;

pub use crate::{
    bloom::{BloomBuilder, BloomFilter},
    chunk::{Chunk, ChunkId, ChunkPin},
    context::MergeContext,
    merge::{
        attempt_major_merge, MergeCursor, MergeError, MergeMetrics, MergeMetricsSnapshot,
        MergeOutcome, MergePlan,
    },
    option::MergeOptions,
    storage::{local::LocalStorage, mem::MemStorage, ChunkStorage, ChunkWriter},
    tree::{
        FileMetadataStore, LsmTree, MemMetadataStore, MetadataStore, TreeCursor, TreeMetadata,
        TreeSnapshot,
    },
};
