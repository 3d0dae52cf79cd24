//! Compactor counters and their snapshot.
//!
//! Registration with an external metrics system is left to the embedding
//! application; it can poll [`CompactorMetrics::snapshot`].

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Snapshot of compactor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactorMetricsSnapshot {
    /// 1 while the compactor is halted.
    pub halted: u64,
    /// Iterations that failed with a retry-class error.
    pub retries: u64,
    /// Iterations finished successfully.
    pub iterations: u64,
    /// Metadata syncs attempted.
    pub syncs: u64,
    /// Metadata syncs that failed.
    pub sync_failures: u64,
    /// Duplicate blocks marked for deletion by garbage collection.
    pub garbage_collected_blocks: u64,
    /// Garbage collection runs that failed.
    pub garbage_collection_failures: u64,
    /// Group compaction runs started.
    pub group_compaction_runs_started: u64,
    /// Group compaction runs completed without error.
    pub group_compaction_runs_completed: u64,
    /// Group compaction runs that failed.
    pub group_compaction_failures: u64,
    /// Plans that produced an output block or retired empty inputs.
    pub group_compactions: u64,
    /// Compactions that merged overlapping blocks.
    pub group_vertical_compactions: u64,
    /// Downsampled blocks uploaded.
    pub downsamples: u64,
    /// Downsampling attempts that failed.
    pub downsample_failures: u64,
    /// Deletion marks written.
    pub blocks_marked_for_deletion: u64,
    /// Blocks physically deleted.
    pub blocks_cleaned: u64,
    /// Physical deletions that failed.
    pub block_cleanup_failures: u64,
    /// Deletions of aborted partial uploads attempted.
    pub partial_uploads_deletion_attempts: u64,
    /// Configured delete delay in seconds.
    pub delete_delay_secs: u64,
}

/// Shared compactor counters.
#[derive(Debug, Default)]
pub struct CompactorMetrics {
    halted: AtomicU64,
    retries: AtomicU64,
    iterations: AtomicU64,
    syncs: AtomicU64,
    sync_failures: AtomicU64,
    garbage_collected_blocks: AtomicU64,
    garbage_collection_failures: AtomicU64,
    group_compaction_runs_started: AtomicU64,
    group_compaction_runs_completed: AtomicU64,
    group_compaction_failures: AtomicU64,
    group_compactions: AtomicU64,
    group_vertical_compactions: AtomicU64,
    downsamples: AtomicU64,
    downsample_failures: AtomicU64,
    blocks_marked_for_deletion: AtomicU64,
    blocks_cleaned: AtomicU64,
    block_cleanup_failures: AtomicU64,
    partial_uploads_deletion_attempts: AtomicU64,
    delete_delay_secs: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CompactorMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_halted(&self, halted: bool) {
        self.halted.store(u64::from(halted), Ordering::Relaxed);
    }

    pub(crate) fn set_delete_delay(&self, delay: Duration) {
        self.delete_delay_secs
            .store(delay.as_secs(), Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        bump(&self.retries);
    }

    pub(crate) fn record_iteration(&self) {
        bump(&self.iterations);
    }

    pub(crate) fn record_sync(&self, ok: bool) {
        bump(&self.syncs);
        if !ok {
            bump(&self.sync_failures);
        }
    }

    pub(crate) fn record_garbage_collected(&self) {
        bump(&self.garbage_collected_blocks);
    }

    pub(crate) fn record_garbage_collection_failure(&self) {
        bump(&self.garbage_collection_failures);
    }

    pub(crate) fn record_group_run_started(&self) {
        bump(&self.group_compaction_runs_started);
    }

    pub(crate) fn record_group_run_finished(&self, ok: bool) {
        if ok {
            bump(&self.group_compaction_runs_completed);
        } else {
            bump(&self.group_compaction_failures);
        }
    }

    pub(crate) fn record_group_compaction(&self, vertical: bool) {
        bump(&self.group_compactions);
        if vertical {
            bump(&self.group_vertical_compactions);
        }
    }

    pub(crate) fn record_downsample(&self, ok: bool) {
        if ok {
            bump(&self.downsamples);
        } else {
            bump(&self.downsample_failures);
        }
    }

    pub(crate) fn record_marked_for_deletion(&self) {
        bump(&self.blocks_marked_for_deletion);
    }

    pub(crate) fn record_block_cleaned(&self, ok: bool) {
        if ok {
            bump(&self.blocks_cleaned);
        } else {
            bump(&self.block_cleanup_failures);
        }
    }

    pub(crate) fn record_partial_upload_deletion_attempt(&self) {
        bump(&self.partial_uploads_deletion_attempts);
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> CompactorMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CompactorMetricsSnapshot {
            halted: load(&self.halted),
            retries: load(&self.retries),
            iterations: load(&self.iterations),
            syncs: load(&self.syncs),
            sync_failures: load(&self.sync_failures),
            garbage_collected_blocks: load(&self.garbage_collected_blocks),
            garbage_collection_failures: load(&self.garbage_collection_failures),
            group_compaction_runs_started: load(&self.group_compaction_runs_started),
            group_compaction_runs_completed: load(&self.group_compaction_runs_completed),
            group_compaction_failures: load(&self.group_compaction_failures),
            group_compactions: load(&self.group_compactions),
            group_vertical_compactions: load(&self.group_vertical_compactions),
            downsamples: load(&self.downsamples),
            downsample_failures: load(&self.downsample_failures),
            blocks_marked_for_deletion: load(&self.blocks_marked_for_deletion),
            blocks_cleaned: load(&self.blocks_cleaned),
            block_cleanup_failures: load(&self.block_cleanup_failures),
            partial_uploads_deletion_attempts: load(&self.partial_uploads_deletion_attempts),
            delete_delay_secs: load(&self.delete_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = CompactorMetrics::new();
        metrics.set_halted(true);
        metrics.record_sync(true);
        metrics.record_sync(false);
        metrics.record_group_compaction(true);
        metrics.record_block_cleaned(false);
        metrics.set_delete_delay(Duration::from_secs(48 * 3600));
        let snap = metrics.snapshot();
        assert_eq!(snap.halted, 1);
        assert_eq!(snap.syncs, 2);
        assert_eq!(snap.sync_failures, 1);
        assert_eq!(snap.group_compactions, 1);
        assert_eq!(snap.group_vertical_compactions, 1);
        assert_eq!(snap.block_cleanup_failures, 1);
        assert_eq!(snap.delete_delay_secs, 172_800);
        metrics.set_halted(false);
        assert_eq!(metrics.snapshot().halted, 0);
    }
}
