//! Physical deletion: aborted partial uploads and blocks whose deletion mark
//! has outlived the delete delay. Every failure here is logged and counted,
//! never returned.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::{
    block::{self, DeletionMark},
    bucket::Bucket,
    clock::Clock,
    fetcher::PartialReason,
    id::{id_age, BlockId},
    metrics::CompactorMetrics,
    observability::{log_debug, log_info, log_warn},
};

/// Delete partial blocks older than `threshold`.
///
/// Blocks whose meta could not be read for transient reasons are skipped:
/// only a missing or corrupt meta proves the upload was aborted.
pub async fn best_effort_clean_aborted_partial_uploads(
    bkt: &dyn Bucket,
    partial: &BTreeMap<BlockId, PartialReason>,
    threshold: Duration,
    clock: &dyn Clock,
    metrics: &CompactorMetrics,
) -> usize {
    let mut deleted = 0;
    for (id, reason) in partial {
        if !reason.is_definite() {
            continue;
        }
        let age = id_age(id, clock.now());
        if age <= threshold {
            log_debug!(
                component = "cleaner",
                event = "partial_block_too_young",
                block = %id,
                age_secs = age.as_secs(),
            );
            continue;
        }
        metrics.record_partial_upload_deletion_attempt();
        match block::delete(bkt, id).await {
            Ok(()) => {
                deleted += 1;
                log_info!(
                    component = "cleaner",
                    event = "aborted_partial_upload_deleted",
                    block = %id,
                    reason = ?reason,
                );
            }
            Err(err) => log_warn!(
                component = "cleaner",
                event = "aborted_partial_upload_delete_failed",
                block = %id,
                error = %err,
            ),
        }
    }
    deleted
}

/// Deletes blocks whose deletion mark is at least `delete_delay` old.
#[derive(Debug)]
pub struct BlocksCleaner {
    bkt: Arc<dyn Bucket>,
    delete_delay: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<CompactorMetrics>,
}

impl BlocksCleaner {
    /// Cleaner with the given delay.
    pub fn new(
        bkt: Arc<dyn Bucket>,
        delete_delay: Duration,
        clock: Arc<dyn Clock>,
        metrics: Arc<CompactorMetrics>,
    ) -> Self {
        Self {
            bkt,
            delete_delay,
            clock,
            metrics,
        }
    }

    /// Delete every block of `marks` whose mark is old enough. The mark age
    /// is checked against the clock right before each deletion. Returns the
    /// number of blocks deleted.
    pub async fn delete_marked_blocks(&self, marks: &BTreeMap<BlockId, DeletionMark>) -> usize {
        let mut deleted = 0;
        for (id, mark) in marks {
            if mark.age(self.clock.now()) < self.delete_delay {
                continue;
            }
            match block::delete(self.bkt.as_ref(), id).await {
                Ok(()) => {
                    deleted += 1;
                    self.metrics.record_block_cleaned(true);
                    log_info!(
                        component = "cleaner",
                        event = "marked_block_deleted",
                        block = %id,
                        marked_at = mark.deletion_time,
                    );
                }
                Err(err) => {
                    self.metrics.record_block_cleaned(false);
                    log_warn!(
                        component = "cleaner",
                        event = "marked_block_delete_failed",
                        block = %id,
                        error = %err,
                    );
                }
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use bytes::Bytes;
    use ulid::Ulid;

    use super::*;
    use crate::{
        block::Meta, bucket::ObjectStoreBucket, clock::ManualClock, labels::Labels,
        test_util::put_block,
    };

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn deletes_only_after_the_delay() {
        let bkt = Arc::new(ObjectStoreBucket::in_memory("test"));
        let start = SystemTime::now();
        let clock = Arc::new(ManualClock::new(start));
        let meta = Meta::new(Ulid::new(), 0, 10, Labels::new());
        put_block(bkt.as_ref(), &meta).await;
        assert!(block::mark_for_deletion(bkt.as_ref(), &meta.ulid, start)
            .await
            .unwrap());
        let marks: BTreeMap<_, _> = [(meta.ulid, DeletionMark::new(meta.ulid, start))].into();

        let metrics = Arc::new(CompactorMetrics::new());
        let cleaner = BlocksCleaner::new(bkt.clone(), 48 * HOUR, clock.clone(), metrics.clone());

        clock.advance(47 * HOUR);
        assert_eq!(cleaner.delete_marked_blocks(&marks).await, 0);
        assert!(block::read_meta(bkt.as_ref(), &meta.ulid).await.is_ok());

        clock.advance(HOUR);
        assert_eq!(cleaner.delete_marked_blocks(&marks).await, 1);
        assert!(bkt.walk(&format!("{}/", meta.ulid)).await.unwrap().is_empty());
        assert_eq!(metrics.snapshot().blocks_cleaned, 1);
    }

    #[tokio::test]
    async fn zero_delay_deletes_immediately() {
        let bkt = Arc::new(ObjectStoreBucket::in_memory("test"));
        let now = SystemTime::now();
        let clock = Arc::new(ManualClock::new(now));
        let meta = Meta::new(Ulid::new(), 0, 10, Labels::new());
        put_block(bkt.as_ref(), &meta).await;
        let marks: BTreeMap<_, _> = [(meta.ulid, DeletionMark::new(meta.ulid, now))].into();
        let cleaner = BlocksCleaner::new(
            bkt.clone(),
            Duration::ZERO,
            clock,
            Arc::new(CompactorMetrics::new()),
        );
        assert_eq!(cleaner.delete_marked_blocks(&marks).await, 1);
    }

    #[tokio::test]
    async fn aborted_uploads_are_removed_once_old_enough() {
        let bkt = ObjectStoreBucket::in_memory("test");
        let now = SystemTime::now();
        let clock = ManualClock::new(now);
        let old = Ulid::from_datetime(now - 3 * 24 * HOUR);
        let young = Ulid::from_datetime(now - HOUR);
        let flaky = Ulid::from_datetime(now - 3 * 24 * HOUR);
        for id in [old, young, flaky] {
            bkt.upload(&format!("{id}/chunks/000001"), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let partial: BTreeMap<_, _> = [
            (old, PartialReason::MissingMeta),
            (young, PartialReason::MissingMeta),
            (flaky, PartialReason::Unreadable("timeout".into())),
        ]
        .into();

        let metrics = CompactorMetrics::new();
        let deleted = best_effort_clean_aborted_partial_uploads(
            &bkt,
            &partial,
            2 * 24 * HOUR,
            &clock,
            &metrics,
        )
        .await;
        assert_eq!(deleted, 1);
        assert!(bkt.walk(&format!("{old}/")).await.unwrap().is_empty());
        assert!(!bkt.walk(&format!("{young}/")).await.unwrap().is_empty());
        assert!(!bkt.walk(&format!("{flaky}/")).await.unwrap().is_empty());
        assert_eq!(metrics.snapshot().partial_uploads_deletion_attempts, 1);
    }
}
