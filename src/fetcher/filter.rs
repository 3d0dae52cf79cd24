//! Filters and modifiers applied to every fetched metadata set.
//!
//! Filters only shrink the set; modifiers rewrite metas in place. Neither
//! performs I/O: everything they need was read by the fetcher.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Mutex,
    time::{Duration, SystemTime},
};

use super::FetchSummary;
use crate::{
    block::{BlockSource, Meta},
    id::{id_age, BlockId},
    relabel::{self, RelabelRule},
};

/// Removes metas from a fetched set.
pub trait MetadataFilter: Send + Sync + fmt::Debug {
    /// Drop unwanted metas, counting each exclusion in `summary`.
    fn filter(
        &self,
        metas: &mut BTreeMap<BlockId, Meta>,
        summary: &mut FetchSummary,
        now: SystemTime,
    );

    /// Whether blocks this filter drops belong to another compactor. Their
    /// deletion marks are then discarded so nothing here deletes them.
    fn disowns_excluded(&self) -> bool {
        false
    }
}

/// Rewrites metas of a fetched set without changing membership.
pub trait MetadataModifier: Send + Sync + fmt::Debug {
    /// Rewrite metas in place, counting changes in `summary`.
    fn modify(&self, metas: &mut BTreeMap<BlockId, Meta>, summary: &mut FetchSummary);
}

/// Keeps only blocks whose external labels survive the relabel rules.
#[derive(Debug)]
pub struct LabelShardedMetaFilter {
    rules: Vec<RelabelRule>,
}

impl LabelShardedMetaFilter {
    /// Filter over compiled rules. No rules keep everything.
    pub fn new(rules: Vec<RelabelRule>) -> Self {
        Self { rules }
    }
}

impl MetadataFilter for LabelShardedMetaFilter {
    fn filter(
        &self,
        metas: &mut BTreeMap<BlockId, Meta>,
        summary: &mut FetchSummary,
        _now: SystemTime,
    ) {
        metas.retain(|_, meta| {
            let keep = relabel::process(&meta.ext.labels, &self.rules).is_some();
            if !keep {
                summary.label_excluded += 1;
            }
            keep
        });
    }

    fn disowns_excluded(&self) -> bool {
        true
    }
}

/// Hides ingested blocks younger than the consistency delay.
///
/// Blocks produced by compaction or downsampling are exempt; they are only
/// visible once fully uploaded.
#[derive(Debug)]
pub struct ConsistencyDelayMetaFilter {
    delay: Duration,
}

impl ConsistencyDelayMetaFilter {
    /// Filter hiding blocks younger than `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl MetadataFilter for ConsistencyDelayMetaFilter {
    fn filter(
        &self,
        metas: &mut BTreeMap<BlockId, Meta>,
        summary: &mut FetchSummary,
        now: SystemTime,
    ) {
        metas.retain(|id, meta| {
            let exempt = matches!(
                meta.ext.source,
                BlockSource::Compactor | BlockSource::Downsampler
            );
            if exempt || id_age(id, now) >= self.delay {
                return true;
            }
            summary.too_fresh += 1;
            false
        });
    }
}

/// Hides blocks whose deletion mark is older than `delay`.
///
/// Younger marked blocks stay visible so their range does not look like a
/// gap, but callers must never use them as input.
#[derive(Debug)]
pub struct IgnoreDeletionMarkFilter {
    delay: Duration,
}

impl IgnoreDeletionMarkFilter {
    /// Filter hiding blocks marked more than `delay` ago.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl MetadataFilter for IgnoreDeletionMarkFilter {
    fn filter(
        &self,
        metas: &mut BTreeMap<BlockId, Meta>,
        summary: &mut FetchSummary,
        now: SystemTime,
    ) {
        metas.retain(|_, meta| match &meta.deletion_mark {
            Some(mark) if mark.age(now) > self.delay => {
                summary.marked_for_deletion += 1;
                false
            }
            _ => true,
        });
    }
}

/// Drops blocks whose sources are fully contained in another block of the
/// same resolution.
///
/// When two blocks have equal sources the one with the higher level wins,
/// then the newer id. Dropped ids are kept until the next run so the syncer
/// can garbage collect them.
#[derive(Debug, Default)]
pub struct DeduplicateFilter {
    duplicates: Mutex<Vec<BlockId>>,
}

impl DeduplicateFilter {
    /// Empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids dropped by the last run.
    pub fn duplicate_ids(&self) -> Vec<BlockId> {
        match self.duplicates.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

struct Candidate<'a> {
    meta: &'a Meta,
    sources: BTreeSet<BlockId>,
}

impl MetadataFilter for DeduplicateFilter {
    fn filter(
        &self,
        metas: &mut BTreeMap<BlockId, Meta>,
        summary: &mut FetchSummary,
        _now: SystemTime,
    ) {
        let duplicates = {
            let mut by_resolution: BTreeMap<i64, Vec<Candidate<'_>>> = BTreeMap::new();
            for meta in metas.values() {
                by_resolution
                    .entry(meta.resolution())
                    .or_default()
                    .push(Candidate {
                        meta,
                        sources: meta.compaction.sources.iter().copied().collect(),
                    });
            }

            let mut duplicates = Vec::new();
            for candidates in by_resolution.values_mut() {
                // Winners first: more sources, then higher level, then newer id.
                candidates.sort_by(|a, b| {
                    (b.sources.len(), b.meta.level(), b.meta.ulid).cmp(&(
                        a.sources.len(),
                        a.meta.level(),
                        a.meta.ulid,
                    ))
                });
                // Kept candidates indexed by each of their sources. A covering
                // block must hold the candidate's first source.
                let mut holders: BTreeMap<BlockId, Vec<usize>> = BTreeMap::new();
                let mut any_kept = false;
                for (idx, candidate) in candidates.iter().enumerate() {
                    let covered = match candidate.sources.first() {
                        Some(first) => holders.get(first).is_some_and(|kept| {
                            kept.iter()
                                .any(|&k| candidate.sources.is_subset(&candidates[k].sources))
                        }),
                        None => any_kept,
                    };
                    if covered {
                        duplicates.push(candidate.meta.ulid);
                        continue;
                    }
                    for source in &candidate.sources {
                        holders.entry(*source).or_default().push(idx);
                    }
                    any_kept = true;
                }
            }
            duplicates
        };

        for id in &duplicates {
            metas.remove(id);
        }
        summary.duplicate += duplicates.len() as u64;
        match self.duplicates.lock() {
            Ok(mut guard) => *guard = duplicates,
            Err(poisoned) => *poisoned.into_inner() = duplicates,
        }
    }
}

/// Strips replica labels so replicas of one stream fall into one group.
#[derive(Debug)]
pub struct ReplicaLabelRemover {
    labels: Vec<String>,
}

impl ReplicaLabelRemover {
    /// Modifier removing `labels`.
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

impl MetadataModifier for ReplicaLabelRemover {
    fn modify(&self, metas: &mut BTreeMap<BlockId, Meta>, summary: &mut FetchSummary) {
        for meta in metas.values_mut() {
            for name in &self.labels {
                if meta.ext.labels.remove(name).is_some() {
                    summary.replica_label_removed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use ulid::Ulid;

    use super::*;
    use crate::{block::DeletionMark, labels::Labels, relabel::RelabelConfig};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn meta_at(created: SystemTime, sources: &[BlockId], level: u32) -> Meta {
        let id = Ulid::from_datetime(created);
        let mut meta = Meta::new(id, 0, 10, Labels::new());
        if !sources.is_empty() {
            meta.compaction.sources = sources.to_vec();
        }
        meta.compaction.level = level;
        meta
    }

    fn into_map(metas: Vec<Meta>) -> BTreeMap<BlockId, Meta> {
        metas.into_iter().map(|m| (m.ulid, m)).collect()
    }

    #[test]
    fn consistency_delay_exempts_engine_output() {
        let now = at(10_000);
        let fresh = meta_at(at(9_990), &[], 1);
        let old = meta_at(at(1_000), &[], 1);
        let mut compacted = meta_at(at(9_995), &[], 2);
        compacted.ext.source = BlockSource::Compactor;
        let mut metas = into_map(vec![fresh.clone(), old.clone(), compacted.clone()]);
        let mut summary = FetchSummary::default();
        ConsistencyDelayMetaFilter::new(Duration::from_secs(60)).filter(
            &mut metas,
            &mut summary,
            now,
        );
        assert!(!metas.contains_key(&fresh.ulid));
        assert!(metas.contains_key(&old.ulid));
        assert!(metas.contains_key(&compacted.ulid));
        assert_eq!(summary.too_fresh, 1);
    }

    #[test]
    fn deletion_mark_filter_uses_half_delay() {
        let now = at(100_000);
        let mut old_mark = meta_at(at(1), &[], 1);
        old_mark.deletion_mark = Some(DeletionMark::new(old_mark.ulid, at(100_000 - 500)));
        let mut young_mark = meta_at(at(2), &[], 1);
        young_mark.deletion_mark = Some(DeletionMark::new(young_mark.ulid, at(100_000 - 100)));
        let mut metas = into_map(vec![old_mark.clone(), young_mark.clone()]);
        let mut summary = FetchSummary::default();
        IgnoreDeletionMarkFilter::new(Duration::from_secs(200)).filter(
            &mut metas,
            &mut summary,
            now,
        );
        assert!(!metas.contains_key(&old_mark.ulid));
        assert!(metas.contains_key(&young_mark.ulid));
        assert_eq!(summary.marked_for_deletion, 1);
    }

    #[test]
    fn dedup_keeps_only_the_superset() {
        let a = meta_at(at(1), &[], 1);
        let b = meta_at(at(2), &[], 1);
        let c = meta_at(at(3), &[], 1);
        let ab = meta_at(at(4), &[a.ulid, b.ulid], 2);
        let abc = meta_at(at(5), &[a.ulid, b.ulid, c.ulid], 3);
        let mut metas = into_map(vec![a.clone(), b, c, ab, abc.clone()]);
        let mut summary = FetchSummary::default();
        let filter = DeduplicateFilter::new();
        filter.filter(&mut metas, &mut summary, at(10));
        assert_eq!(metas.keys().copied().collect::<Vec<_>>(), vec![abc.ulid]);
        assert_eq!(summary.duplicate, 4);
        assert_eq!(filter.duplicate_ids().len(), 4);
        assert!(filter.duplicate_ids().contains(&a.ulid));
    }

    #[test]
    fn dedup_equal_sources_prefers_level_then_newer() {
        let src = Ulid::from_datetime(at(1));
        let low = meta_at(at(2), &[src], 2);
        let high = meta_at(at(3), &[src], 3);
        let newer_high = meta_at(at(4), &[src], 3);
        let mut metas = into_map(vec![low, high, newer_high.clone()]);
        let mut summary = FetchSummary::default();
        DeduplicateFilter::new().filter(&mut metas, &mut summary, at(10));
        assert_eq!(metas.keys().copied().collect::<Vec<_>>(), vec![newer_high.ulid]);
    }

    #[test]
    fn dedup_keeps_partially_overlapping_blocks() {
        let srcs: Vec<BlockId> = (1..=4).map(|i| Ulid::from_datetime(at(i))).collect();
        let left = meta_at(at(10), &srcs[..2], 2);
        let right = meta_at(at(11), &srcs[2..], 2);
        let middle = meta_at(at(12), &srcs[1..3], 2);
        let inner = meta_at(at(13), &srcs[1..2], 1);
        let mut metas = into_map(vec![left.clone(), right.clone(), middle.clone(), inner.clone()]);
        let mut summary = FetchSummary::default();
        DeduplicateFilter::new().filter(&mut metas, &mut summary, at(20));
        assert_eq!(metas.len(), 3);
        assert!(!metas.contains_key(&inner.ulid));
        assert!(metas.contains_key(&middle.ulid));
    }

    #[test]
    fn dedup_is_per_resolution() {
        let raw = meta_at(at(1), &[], 2);
        let mut down = raw.clone();
        down.ulid = Ulid::from_datetime(at(2));
        down.ext.downsample.resolution = 300_000;
        let mut metas = into_map(vec![raw, down]);
        let mut summary = FetchSummary::default();
        DeduplicateFilter::new().filter(&mut metas, &mut summary, at(10));
        assert_eq!(metas.len(), 2);
    }

    #[test]
    fn label_shard_and_replica_remover() {
        let rules = relabel::compile(&[RelabelConfig {
            source_labels: vec!["cluster".into()],
            regex: "a".into(),
            action: relabel::RelabelAction::Keep,
            ..Default::default()
        }])
        .unwrap();
        let mut keep = meta_at(at(1), &[], 1);
        keep.ext.labels = [("cluster", "a"), ("replica", "r1")].into_iter().collect();
        let mut other = meta_at(at(2), &[], 1);
        other.ext.labels = [("cluster", "b")].into_iter().collect();
        let mut metas = into_map(vec![keep.clone(), other]);
        let mut summary = FetchSummary::default();
        LabelShardedMetaFilter::new(rules).filter(&mut metas, &mut summary, at(10));
        ReplicaLabelRemover::new(vec!["replica".into()]).modify(&mut metas, &mut summary);
        assert_eq!(metas.len(), 1);
        assert_eq!(
            metas[&keep.ulid].ext.labels,
            [("cluster", "a")].into_iter().collect::<Labels>()
        );
        assert_eq!(summary.label_excluded, 1);
        assert_eq!(summary.replica_label_removed, 1);
    }
}
