//! Major merge: fold the sealed chunks behind the mutable head into one.
//!
//! An attempt takes the tree lock twice: once to plan and once to install.
//! Everything in between (reading the inputs, writing the output store and
//! its bloom filter) runs without it.

pub mod cursor;
mod error;
pub mod executor;
pub mod installer;
mod metrics;
pub mod planner;

use std::time::Instant;

pub use cursor::MergeCursor;
pub use error::MergeError;
pub use executor::execute;
pub use installer::install;
use metrics::duration_ms;
pub use metrics::{MergeJobSnapshot, MergeMetrics, MergeMetricsSnapshot};
pub use planner::MergePlan;

use crate::{
    chunk::ChunkId,
    observability::{log_debug, log_error, log_info},
    tree::LsmTree,
};

/// Result of one merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A merge was installed.
    Merged {
        /// Id of the chunk holding the merged records.
        chunk_id: ChunkId,
        /// Input chunks consumed.
        chunks_consumed: usize,
        /// Records written to the new chunk.
        records_written: u64,
    },
    /// Fewer than two chunks were eligible; retry later.
    NoWorkAvailable,
}

/// Plan, execute, and install one major merge on `tree`.
///
/// Returns [`MergeOutcome::NoWorkAvailable`] without touching the tree when
/// nothing can be merged. On error the tree is unchanged.
pub fn attempt_major_merge(tree: &LsmTree) -> Result<MergeOutcome, MergeError> {
    let metrics = tree.context().metrics();
    metrics.record_attempt();

    let Some(plan) = tree.plan_merge() else {
        metrics.record_no_work();
        log_debug!(
            component = "planner",
            event = "merge_no_work",
            tree = %tree.name(),
        );
        return Ok(MergeOutcome::NoWorkAvailable);
    };
    log_info!(
        component = "planner",
        event = "merge_planned",
        tree = %tree.name(),
        span = plan.span(),
        expected_records = plan.expected_records(),
        generation = plan.generation(),
    );

    let started = Instant::now();
    let result = execute(tree, &plan).and_then(|output| {
        let chunk_id = output.id();
        let records_written = output.record_count();
        install(tree, &plan, output)?;
        Ok((chunk_id, records_written))
    });
    let (chunk_id, records_written) = match result {
        Ok(done) => done,
        Err(err) => {
            metrics.record_failure();
            log_error!(
                component = "merge",
                event = "merge_failed",
                tree = %tree.name(),
                span = plan.span(),
                error = %err,
            );
            return Err(err);
        }
    };

    metrics.record_merge(MergeJobSnapshot {
        chunk_id: chunk_id.raw(),
        chunks_consumed: plan.span() as u64,
        records_in: plan.expected_records(),
        records_out: records_written,
        duration_ms: duration_ms(started.elapsed()),
    });
    Ok(MergeOutcome::Merged {
        chunk_id,
        chunks_consumed: plan.span(),
        records_written,
    })
}
