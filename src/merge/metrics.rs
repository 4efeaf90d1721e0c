//! Major-merge counters.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Summary of one installed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeJobSnapshot {
    /// Id of the chunk the merge produced.
    pub chunk_id: u64,
    /// Chunks the merge consumed.
    pub chunks_consumed: u64,
    /// Records summed over the inputs at planning time.
    pub records_in: u64,
    /// Records written to the output chunk.
    pub records_out: u64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Point-in-time copy of [`MergeMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeMetricsSnapshot {
    /// Calls to `attempt_major_merge`.
    pub attempts: u64,
    /// Merges that were installed.
    pub merges: u64,
    /// Attempts that found nothing to merge.
    pub no_work: u64,
    /// Attempts that failed in execution or installation.
    pub failures: u64,
    /// Input chunks consumed by installed merges.
    pub chunks_consumed: u64,
    /// Records written by installed merges.
    pub records_written: u64,
    /// Total duration of installed merges, in milliseconds.
    pub duration_ms_total: u64,
    /// Last installed merge, if any.
    pub last_job: Option<MergeJobSnapshot>,
}

/// Shared merge counters.
#[derive(Debug, Default)]
pub struct MergeMetrics {
    attempts: AtomicU64,
    merges: AtomicU64,
    no_work: AtomicU64,
    failures: AtomicU64,
    chunks_consumed: AtomicU64,
    records_written: AtomicU64,
    duration_ms_total: AtomicU64,
    last_job_present: AtomicU64,
    last_job_chunk_id: AtomicU64,
    last_job_chunks_consumed: AtomicU64,
    last_job_records_in: AtomicU64,
    last_job_records_out: AtomicU64,
    last_job_duration_ms: AtomicU64,
}

impl MergeMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_no_work(&self) {
        self.no_work.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merge(&self, job: MergeJobSnapshot) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        self.chunks_consumed
            .fetch_add(job.chunks_consumed, Ordering::Relaxed);
        self.records_written
            .fetch_add(job.records_out, Ordering::Relaxed);
        self.duration_ms_total
            .fetch_add(job.duration_ms, Ordering::Relaxed);
        self.last_job_chunk_id.store(job.chunk_id, Ordering::Relaxed);
        self.last_job_chunks_consumed
            .store(job.chunks_consumed, Ordering::Relaxed);
        self.last_job_records_in
            .store(job.records_in, Ordering::Relaxed);
        self.last_job_records_out
            .store(job.records_out, Ordering::Relaxed);
        self.last_job_duration_ms
            .store(job.duration_ms, Ordering::Relaxed);
        self.last_job_present.store(1, Ordering::Release);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MergeMetricsSnapshot {
        let last_job = (self.last_job_present.load(Ordering::Acquire) == 1).then(|| {
            MergeJobSnapshot {
                chunk_id: self.last_job_chunk_id.load(Ordering::Relaxed),
                chunks_consumed: self.last_job_chunks_consumed.load(Ordering::Relaxed),
                records_in: self.last_job_records_in.load(Ordering::Relaxed),
                records_out: self.last_job_records_out.load(Ordering::Relaxed),
                duration_ms: self.last_job_duration_ms.load(Ordering::Relaxed),
            }
        });
        MergeMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            no_work: self.no_work.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            chunks_consumed: self.chunks_consumed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            duration_ms_total: self.duration_ms_total.load(Ordering::Relaxed),
            last_job,
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{MergeJobSnapshot, MergeMetrics};

    #[test]
    fn counters_accumulate_across_jobs() {
        let metrics = MergeMetrics::new();
        metrics.record_attempt();
        metrics.record_no_work();
        metrics.record_attempt();
        metrics.record_merge(MergeJobSnapshot {
            chunk_id: 7,
            chunks_consumed: 3,
            records_in: 12,
            records_out: 10,
            duration_ms: 5,
        });
        metrics.record_attempt();
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.no_work, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.merges, 1);
        assert_eq!(snapshot.chunks_consumed, 3);
        assert_eq!(snapshot.records_written, 10);
        assert_eq!(snapshot.last_job.map(|job| job.chunk_id), Some(7));
    }

    #[test]
    fn fresh_metrics_have_no_last_job() {
        assert!(MergeMetrics::new().snapshot().last_job.is_none());
    }
}
