//! Block metadata discovery.
//!
//! [`MetaFetcher`] lists block directories, reads every meta and deletion
//! mark with bounded concurrency, and runs the filter chain once per fetch.

pub mod filter;
/// Shared snapshots of fetched block lists.
pub mod view;

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use futures_util::{stream, StreamExt};

pub use self::{
    filter::{
        ConsistencyDelayMetaFilter, DeduplicateFilter, IgnoreDeletionMarkFilter,
        LabelShardedMetaFilter, MetadataFilter, MetadataModifier, ReplicaLabelRemover,
    },
    view::{BlocksView, BlocksViewSnapshot},
};
use crate::{
    block::{self, DeletionMark, Meta, MetaError},
    bucket::Bucket,
    clock::Clock,
    error::{CompactError, ResultExt},
    id::{parse_block_dir, BlockId},
    observability::{log_debug, log_warn},
};

/// Why a block without a usable meta was recorded as partial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialReason {
    /// No `meta.json`: an upload in progress or an aborted one.
    MissingMeta,
    /// `meta.json` exists but does not parse or validate.
    Corrupted(String),
    /// The meta or mark could not be read for a reason unrelated to its content.
    Unreadable(String),
}

impl PartialReason {
    /// Returns `true` if the block is known to lack a valid meta, as opposed
    /// to merely failing to read this time.
    pub fn is_definite(&self) -> bool {
        !matches!(self, PartialReason::Unreadable(_))
    }
}

/// Counters describing one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Block directories listed.
    pub listed: u64,
    /// Metas loaded successfully.
    pub loaded: u64,
    /// Metas that could not be read.
    pub failed: u64,
    /// Directories without a meta.
    pub no_meta: u64,
    /// Metas that did not parse or validate.
    pub corrupted_meta: u64,
    /// Excluded by the consistency delay.
    pub too_fresh: u64,
    /// Excluded because their deletion mark is old.
    pub marked_for_deletion: u64,
    /// Excluded as duplicates.
    pub duplicate: u64,
    /// Excluded by the relabel selector.
    pub label_excluded: u64,
    /// Replica labels stripped.
    pub replica_label_removed: u64,
}

/// Result of one fetch.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Usable metas after the filter chain.
    pub metas: BTreeMap<BlockId, Meta>,
    /// Blocks without a usable meta.
    pub partial: BTreeMap<BlockId, PartialReason>,
    /// Deletion marks of blocks this compactor owns, including partial blocks
    /// and blocks hidden by filters other than the label shard.
    pub deletion_marks: BTreeMap<BlockId, DeletionMark>,
    /// Counters.
    pub summary: FetchSummary,
}

/// Callback invoked whenever the fetched block list or the fetch error changes.
pub type Observer = Arc<dyn Fn(&[Meta], Option<&CompactError>) + Send + Sync>;

#[derive(PartialEq)]
enum Observed {
    Blocks(Vec<Meta>),
    Failed(String),
}

/// Bounded-concurrency metadata fetcher with a filter chain.
pub struct MetaFetcher {
    bkt: Arc<dyn Bucket>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
    filters: Vec<Arc<dyn MetadataFilter>>,
    modifiers: Vec<Arc<dyn MetadataModifier>>,
    observers: Vec<Observer>,
    last_observed: Mutex<Option<Observed>>,
}

impl fmt::Debug for MetaFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaFetcher")
            .field("bucket", &self.bkt.name())
            .field("concurrency", &self.concurrency)
            .field("filters", &self.filters)
            .field("modifiers", &self.modifiers)
            .field("observers", &self.observers.len())
            .finish()
    }
}

enum Loaded {
    Meta(Box<Meta>, Option<DeletionMark>),
    Partial(PartialReason, Option<DeletionMark>),
}

impl MetaFetcher {
    /// Fetcher without filters.
    pub fn new(bkt: Arc<dyn Bucket>, clock: Arc<dyn Clock>, concurrency: usize) -> Self {
        Self {
            bkt,
            clock,
            concurrency: concurrency.max(1),
            filters: Vec::new(),
            modifiers: Vec::new(),
            observers: Vec::new(),
            last_observed: Mutex::new(None),
        }
    }

    /// Append a filter; filters run in insertion order.
    pub fn with_filter(mut self, filter: Arc<dyn MetadataFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append a modifier; modifiers run after every filter.
    pub fn with_modifier(mut self, modifier: Arc<dyn MetadataModifier>) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Register a change observer.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observers.push(observer);
        self
    }

    async fn load(&self, id: BlockId) -> Loaded {
        let bkt = self.bkt.as_ref();
        let mark = match block::read_deletion_mark(bkt, &id).await {
            Ok(mark) => mark,
            Err(MetaError::Bucket(err)) => {
                return Loaded::Partial(PartialReason::Unreadable(err.to_string()), None)
            }
            Err(err) => {
                log_warn!(
                    component = "fetcher",
                    event = "deletion_mark_corrupted",
                    block = %id,
                    error = %err,
                );
                None
            }
        };
        match block::read_meta(bkt, &id).await {
            Ok(meta) => Loaded::Meta(Box::new(meta), mark),
            Err(err) if err.is_not_found() => Loaded::Partial(PartialReason::MissingMeta, mark),
            Err(MetaError::Bucket(err)) => {
                Loaded::Partial(PartialReason::Unreadable(err.to_string()), mark)
            }
            Err(err) => Loaded::Partial(PartialReason::Corrupted(err.to_string()), mark),
        }
    }

    /// Discover blocks and run the filter chain.
    ///
    /// Listing failure fails the fetch; per-block failures end up in
    /// [`SyncState::partial`].
    pub async fn fetch(&self) -> Result<SyncState, CompactError> {
        let entries = match self.bkt.list("").await.context("list block directories") {
            Ok(entries) => entries,
            Err(err) => {
                self.notify(Observed::Failed(err.to_string()), &[], Some(&err));
                return Err(err);
            }
        };
        let ids: Vec<BlockId> = entries
            .iter()
            .filter(|entry| entry.ends_with('/'))
            .filter_map(|entry| parse_block_dir(entry))
            .collect();

        let mut state = SyncState::default();
        state.summary.listed = ids.len() as u64;

        let loaded: Vec<(BlockId, Loaded)> = stream::iter(ids)
            .map(|id| async move { (id, self.load(id).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, loaded) in loaded {
            let mark = match loaded {
                Loaded::Meta(mut meta, mark) => {
                    state.summary.loaded += 1;
                    meta.deletion_mark = mark;
                    state.metas.insert(id, *meta);
                    mark
                }
                Loaded::Partial(reason, mark) => {
                    match &reason {
                        PartialReason::MissingMeta => state.summary.no_meta += 1,
                        PartialReason::Corrupted(_) => state.summary.corrupted_meta += 1,
                        PartialReason::Unreadable(_) => state.summary.failed += 1,
                    }
                    log_debug!(
                        component = "fetcher",
                        event = "partial_block",
                        block = %id,
                        reason = ?reason,
                    );
                    state.partial.insert(id, reason);
                    mark
                }
            };
            if let Some(mark) = mark {
                state.deletion_marks.insert(id, mark);
            }
        }

        let now = self.clock.now();
        for filter in &self.filters {
            let owned: Option<Vec<BlockId>> = filter
                .disowns_excluded()
                .then(|| state.metas.keys().copied().collect());
            filter.filter(&mut state.metas, &mut state.summary, now);
            for id in owned.into_iter().flatten() {
                if !state.metas.contains_key(&id) {
                    state.deletion_marks.remove(&id);
                }
            }
        }
        for modifier in &self.modifiers {
            modifier.modify(&mut state.metas, &mut state.summary);
        }

        log_debug!(
            component = "fetcher",
            event = "metas_fetched",
            bucket = self.bkt.name(),
            listed = state.summary.listed,
            loaded = state.summary.loaded,
            partial = state.partial.len(),
            visible = state.metas.len(),
        );

        let blocks: Vec<Meta> = state.metas.values().cloned().collect();
        self.notify(Observed::Blocks(blocks.clone()), &blocks, None);
        Ok(state)
    }

    fn notify(&self, observed: Observed, blocks: &[Meta], err: Option<&CompactError>) {
        if self.observers.is_empty() {
            return;
        }
        let mut guard = match self.last_observed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref() == Some(&observed) {
            return;
        }
        *guard = Some(observed);
        drop(guard);
        for observer in &self.observers {
            observer(blocks, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, SystemTime},
    };

    use bytes::Bytes;
    use ulid::Ulid;

    use super::*;
    use crate::{
        block::DELETION_MARK_FILENAME,
        bucket::ObjectStoreBucket,
        clock::ManualClock,
        labels::Labels,
    };

    async fn put_meta(bkt: &ObjectStoreBucket, meta: &Meta) {
        bkt.upload(
            &format!("{}/meta.json", meta.ulid),
            Bytes::from(meta.to_json().unwrap()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn fetch_sorts_blocks_into_metas_and_partial() {
        let bkt = Arc::new(ObjectStoreBucket::in_memory("test"));
        let good = Meta::new(Ulid::new(), 0, 10, Labels::new());
        put_meta(&bkt, &good).await;

        let missing = Ulid::new();
        bkt.upload(&format!("{missing}/chunks/000001"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let corrupt = Ulid::new();
        bkt.upload(&format!("{corrupt}/meta.json"), Bytes::from_static(b"{"))
            .await
            .unwrap();

        let marked = Meta::new(Ulid::new(), 10, 20, Labels::new());
        put_meta(&bkt, &marked).await;
        let mark = DeletionMark::new(marked.ulid, SystemTime::now());
        bkt.upload(
            &format!("{}/{DELETION_MARK_FILENAME}", marked.ulid),
            Bytes::from(mark.to_json().unwrap()),
        )
        .await
        .unwrap();

        bkt.upload("debug/other", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let fetcher = MetaFetcher::new(bkt, clock, 4);
        let state = fetcher.fetch().await.unwrap();

        assert_eq!(state.metas.len(), 2);
        assert_eq!(state.metas[&marked.ulid].deletion_mark, Some(mark));
        assert_eq!(state.partial[&missing], PartialReason::MissingMeta);
        assert!(matches!(state.partial[&corrupt], PartialReason::Corrupted(_)));
        assert_eq!(state.deletion_marks.len(), 1);
        assert_eq!(state.summary.listed, 4);
        assert_eq!(state.summary.no_meta, 1);
        assert_eq!(state.summary.corrupted_meta, 1);
    }

    #[tokio::test]
    async fn marks_of_other_shards_are_dropped() {
        let bkt = Arc::new(ObjectStoreBucket::in_memory("test"));
        let now = SystemTime::now();
        let mut ids = Vec::new();
        for cluster in ["a", "b"] {
            let meta = Meta::new(
                Ulid::new(),
                0,
                10,
                [("cluster", cluster)].into_iter().collect(),
            );
            put_meta(&bkt, &meta).await;
            let mark = DeletionMark::new(meta.ulid, now);
            bkt.upload(
                &format!("{}/{DELETION_MARK_FILENAME}", meta.ulid),
                Bytes::from(mark.to_json().unwrap()),
            )
            .await
            .unwrap();
            ids.push(meta.ulid);
        }
        let rules = crate::relabel::compile(&[crate::relabel::RelabelConfig {
            source_labels: vec!["cluster".into()],
            regex: "a".into(),
            action: crate::relabel::RelabelAction::Keep,
            ..Default::default()
        }])
        .unwrap();
        let clock = Arc::new(ManualClock::new(now + Duration::from_secs(3600)));
        let fetcher = MetaFetcher::new(bkt, clock, 2)
            .with_filter(Arc::new(LabelShardedMetaFilter::new(rules)))
            .with_filter(Arc::new(IgnoreDeletionMarkFilter::new(Duration::from_secs(60))));

        let state = fetcher.fetch().await.unwrap();
        assert!(state.metas.is_empty());
        assert_eq!(
            state.deletion_marks.keys().copied().collect::<Vec<_>>(),
            vec![ids[0]]
        );
    }

    #[tokio::test]
    async fn observers_fire_only_on_change() {
        let bkt = Arc::new(ObjectStoreBucket::in_memory("test"));
        put_meta(&bkt, &Meta::new(Ulid::new(), 0, 10, Labels::new())).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let fetcher = MetaFetcher::new(bkt.clone(), clock.clone(), 2)
            .with_filter(Arc::new(ConsistencyDelayMetaFilter::new(Duration::from_secs(60))))
            .with_observer(Arc::new(move |blocks: &[Meta], err: Option<&CompactError>| {
                assert!(err.is_none());
                let _ = blocks;
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        let state = fetcher.fetch().await.unwrap();
        assert!(state.metas.is_empty());
        assert_eq!(state.summary.too_fresh, 1);
        fetcher.fetch().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(120));
        let state = fetcher.fetch().await.unwrap();
        assert_eq!(state.metas.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
