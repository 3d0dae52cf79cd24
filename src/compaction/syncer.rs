//! Authoritative view of the bucket used by every stage of an iteration.

use std::{collections::BTreeMap, sync::Arc};

use async_lock::RwLock;

use super::group::{group_metas, Group};
use crate::{
    block::{self, DeletionMark, Meta},
    bucket::Bucket,
    clock::Clock,
    error::{CompactError, ResultExt},
    fetcher::{
        ConsistencyDelayMetaFilter, DeduplicateFilter, IgnoreDeletionMarkFilter,
        LabelShardedMetaFilter, MetaFetcher, Observer, PartialReason, ReplicaLabelRemover,
        SyncState,
    },
    id::BlockId,
    metrics::CompactorMetrics,
    observability::{log_debug, log_info},
    option::CompactorOptions,
    relabel,
};

/// Caches the last fetch and derives compaction groups from it.
#[derive(Debug)]
pub struct Syncer {
    bkt: Arc<dyn Bucket>,
    fetcher: MetaFetcher,
    duplicates: Arc<DeduplicateFilter>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CompactorMetrics>,
    state: RwLock<SyncState>,
}

impl Syncer {
    /// Syncer over a prepared fetcher. `duplicates` must be part of the
    /// fetcher's filter chain.
    pub fn new(
        bkt: Arc<dyn Bucket>,
        fetcher: MetaFetcher,
        duplicates: Arc<DeduplicateFilter>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CompactorMetrics>,
    ) -> Self {
        Self {
            bkt,
            fetcher,
            duplicates,
            clock,
            metrics,
            state: RwLock::new(SyncState::default()),
        }
    }

    /// Syncer with the standard filter chain configured from `opts`:
    /// label shard, consistency delay, deletion marks older than half the
    /// delete delay, duplicates, then replica label removal.
    pub fn from_options(
        opts: &CompactorOptions,
        bkt: Arc<dyn Bucket>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CompactorMetrics>,
        observer: Option<Observer>,
    ) -> Result<Self, CompactError> {
        let rules = relabel::compile(&opts.selector_relabel)?;
        let duplicates = Arc::new(DeduplicateFilter::new());
        let mut fetcher = MetaFetcher::new(
            Arc::clone(&bkt),
            Arc::clone(&clock),
            opts.block_sync_concurrency,
        )
        .with_filter(Arc::new(LabelShardedMetaFilter::new(rules)))
        .with_filter(Arc::new(ConsistencyDelayMetaFilter::new(
            opts.consistency_delay,
        )))
        .with_filter(Arc::new(IgnoreDeletionMarkFilter::new(opts.delete_delay / 2)))
        .with_filter(duplicates.clone())
        .with_modifier(Arc::new(ReplicaLabelRemover::new(
            opts.dedup_replica_labels.clone(),
        )));
        if let Some(observer) = observer {
            fetcher = fetcher.with_observer(observer);
        }
        Ok(Self::new(bkt, fetcher, duplicates, clock, metrics))
    }

    /// Re-fetch metadata. Failures are retry-class.
    pub async fn sync_metas(&self) -> Result<(), CompactError> {
        let fetched = self.fetcher.fetch().await;
        self.metrics.record_sync(fetched.is_ok());
        let fetched = fetched.retry().context("sync metas")?;
        log_debug!(
            component = "syncer",
            event = "metas_synced",
            metas = fetched.metas.len(),
            partial = fetched.partial.len(),
            marks = fetched.deletion_marks.len(),
        );
        *self.state.write().await = fetched;
        Ok(())
    }

    /// Usable metas of the last sync.
    pub async fn metas(&self) -> BTreeMap<BlockId, Meta> {
        self.state.read().await.metas.clone()
    }

    /// Partial blocks of the last sync.
    pub async fn partial(&self) -> BTreeMap<BlockId, PartialReason> {
        self.state.read().await.partial.clone()
    }

    /// Every deletion mark seen by the last sync, plus marks written since.
    pub async fn deletion_marks(&self) -> BTreeMap<BlockId, DeletionMark> {
        self.state.read().await.deletion_marks.clone()
    }

    /// Compaction groups of the last sync, ordered by key.
    pub async fn groups(&self) -> Vec<Group> {
        let state = self.state.read().await;
        group_metas(state.metas.values())
    }

    /// Mark blocks dropped by the duplicate filter for deletion; a compacted
    /// block already covers them. Failures are retry-class.
    pub async fn garbage_collect(&self) -> Result<(), CompactError> {
        let duplicates = self.duplicates.duplicate_ids();
        let already_marked = self.deletion_marks().await;
        for id in duplicates {
            if already_marked.contains_key(&id) {
                continue;
            }
            let now = self.clock.now();
            let marked = match block::mark_for_deletion(self.bkt.as_ref(), &id, now).await {
                Ok(marked) => marked,
                Err(err) => {
                    self.metrics.record_garbage_collection_failure();
                    return Err(err
                        .into_retry()
                        .context(format!("garbage collect duplicate {id}")));
                }
            };
            if marked {
                self.metrics.record_marked_for_deletion();
                self.metrics.record_garbage_collected();
                log_info!(
                    component = "syncer",
                    event = "duplicate_marked_for_deletion",
                    block = %id,
                );
            }
            self.state
                .write()
                .await
                .deletion_marks
                .insert(id, DeletionMark::new(id, now));
        }
        Ok(())
    }
}
