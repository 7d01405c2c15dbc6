//! Cheap observable counters. One [`EngineMetrics`] lives on each table
//! handle; callers snapshot it whenever they want numbers.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub commits: AtomicU64,
    pub commit_conflicts: AtomicU64,
    pub commit_retries: AtomicU64,
    pub files_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub files_read: AtomicU64,
    pub rows_read: AtomicU64,
    pub rows_written: AtomicU64,
    pub files_pruned: AtomicU64,
    pub cdc_records_emitted: AtomicU64,
    pub checkpoints_written: AtomicU64,
    pub files_vacuumed: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub commits: u64,
    pub commit_conflicts: u64,
    pub commit_retries: u64,
    pub files_written: u64,
    pub bytes_written: u64,
    pub files_read: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub files_pruned: u64,
    pub cdc_records_emitted: u64,
    pub checkpoints_written: u64,
    pub files_vacuumed: u64,
}

impl EngineMetrics {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            commit_conflicts: self.commit_conflicts.load(Ordering::Relaxed),
            commit_retries: self.commit_retries.load(Ordering::Relaxed),
            files_written: self.files_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_read: self.files_read.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            files_pruned: self.files_pruned.load(Ordering::Relaxed),
            cdc_records_emitted: self.cdc_records_emitted.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            files_vacuumed: self.files_vacuumed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = EngineMetrics::default();
        EngineMetrics::incr(&metrics.commits);
        EngineMetrics::add(&metrics.bytes_written, 42);
        EngineMetrics::incr(&metrics.commits);
        let snap = metrics.snapshot();
        assert_eq!(snap.commits, 2);
        assert_eq!(snap.bytes_written, 42);
        assert_eq!(snap.files_read, 0);
    }
}
