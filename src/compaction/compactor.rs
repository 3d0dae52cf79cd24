//! Group compaction: plan, download, verify, merge, upload, retire.
//!
//! The output block is uploaded before any input is marked for deletion, so
//! a crash at any point leaves either the inputs or the output visible.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::{stream, StreamExt};

use super::{
    group::Group,
    merge::BlockMerger,
    planner::Planner,
    syncer::Syncer,
};
use crate::{
    block::{self, BlockData, BlockSource, CompactionMeta, Downsample, ExtMeta, Meta},
    bucket::Bucket,
    clock::Clock,
    error::{most_severe, CompactError, ErrorCause, ResultExt},
    id::{BlockId, BlockIdGenerator},
    metrics::CompactorMetrics,
    observability::{log_debug, log_info, log_warn},
};

/// Scratch directory removed when dropped, including on cancellation.
#[derive(Debug)]
pub(crate) struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub(crate) async fn create(path: PathBuf) -> Result<Self, CompactError> {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("clear {}", path.display()))?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("create {}", path.display()))?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log_warn!(
                    component = "compactor",
                    event = "workdir_cleanup_failed",
                    path = %self.path.display(),
                    error = %err,
                );
            }
        }
    }
}

/// Remove and recreate a stage's scratch root.
pub(crate) async fn reset_dir(path: &Path) -> Result<(), CompactError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(CompactError::from(err).context(format!("clear {}", path.display())))
        }
    }
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("create {}", path.display()))
}

/// Check a downloaded block before using it as input. Problems are
/// halt-class; a stats mismatch only warns when `accept_malformed_index`
/// is set.
pub(crate) async fn verify_block(
    dir: &Path,
    meta: &Meta,
    accept_malformed_index: bool,
) -> Result<BlockData, CompactError> {
    let unhealthy = |reason: String| {
        CompactError::halt(ErrorCause::UnhealthyBlock {
            id: meta.ulid,
            reason,
        })
    };
    let data = match block::read_local_data(dir, meta).await {
        Ok(data) => data,
        Err(err) => return Err(unhealthy(format!("undecodable data: {err}"))),
    };
    if data.num_samples() != meta.stats.num_samples {
        let reason = format!(
            "meta reports {} samples, data holds {}",
            meta.stats.num_samples,
            data.num_samples()
        );
        if !accept_malformed_index {
            return Err(unhealthy(reason));
        }
        log_warn!(
            component = "compactor",
            event = "malformed_block_accepted",
            block = %meta.ulid,
            reason = %reason,
        );
    }
    if let Some((lo, hi)) = data.time_bounds() {
        if lo < meta.min_time || hi >= meta.max_time {
            return Err(unhealthy(format!(
                "samples span [{lo}, {hi}] outside [{}, {})",
                meta.min_time, meta.max_time
            )));
        }
    }
    Ok(data)
}

/// Runs compaction passes over every group until none has work left.
#[derive(Debug)]
pub struct BucketCompactor {
    syncer: Arc<Syncer>,
    bkt: Arc<dyn Bucket>,
    planner: Arc<dyn Planner>,
    merger: Arc<dyn BlockMerger>,
    clock: Arc<dyn Clock>,
    ids: Arc<BlockIdGenerator>,
    metrics: Arc<CompactorMetrics>,
    compact_dir: PathBuf,
    concurrency: usize,
    vertical: bool,
    accept_malformed_index: bool,
}

/// Knobs for [`BucketCompactor::new`].
#[derive(Debug, Clone)]
pub struct BucketCompactorConfig {
    /// Scratch root; every plan works in `<compact_dir>/<output id>/`.
    pub compact_dir: PathBuf,
    /// Groups compacted concurrently.
    pub concurrency: usize,
    /// Whether overlapping blocks may be merged.
    pub vertical: bool,
    /// Only warn on input stats mismatches.
    pub accept_malformed_index: bool,
}

impl BucketCompactor {
    /// Compactor over a syncer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        syncer: Arc<Syncer>,
        bkt: Arc<dyn Bucket>,
        planner: Arc<dyn Planner>,
        merger: Arc<dyn BlockMerger>,
        clock: Arc<dyn Clock>,
        ids: Arc<BlockIdGenerator>,
        metrics: Arc<CompactorMetrics>,
        config: BucketCompactorConfig,
    ) -> Self {
        Self {
            syncer,
            bkt,
            planner,
            merger,
            clock,
            ids,
            metrics,
            compact_dir: config.compact_dir,
            concurrency: config.concurrency.max(1),
            vertical: config.vertical,
            accept_malformed_index: config.accept_malformed_index,
        }
    }

    /// Compact until no group has work. Each pass re-syncs and garbage
    /// collects first. When several groups fail, a halt-class error wins.
    pub async fn compact(&self) -> Result<(), CompactError> {
        reset_dir(&self.compact_dir).await?;
        loop {
            self.syncer.sync_metas().await?;
            self.syncer.garbage_collect().await?;
            let groups = self.syncer.groups().await;
            log_debug!(
                component = "compactor",
                event = "compaction_pass_started",
                groups = groups.len(),
            );

            let results: Vec<Result<bool, CompactError>> = stream::iter(groups)
                .map(|group| async move {
                    self.metrics.record_group_run_started();
                    let result = self
                        .compact_group(&group)
                        .await
                        .with_context(|| format!("compaction of group {}", group.key()));
                    self.metrics.record_group_run_finished(result.is_ok());
                    result
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            let mut progressed = false;
            let mut errors = Vec::new();
            for result in results {
                match result {
                    Ok(did_work) => progressed |= did_work,
                    Err(err) => errors.push(err),
                }
            }
            if let Some(err) = most_severe(errors) {
                return Err(err);
            }
            if !progressed {
                break;
            }
        }
        log_info!(component = "compactor", event = "compaction_finished");
        Ok(())
    }

    /// Run one plan of `group`. Returns `true` if blocks were retired.
    pub async fn compact_group(&self, group: &Group) -> Result<bool, CompactError> {
        let plan = self.planner.plan(group)?;
        if plan.len() < 2 {
            return Ok(false);
        }
        check_disjoint_sources(&plan)?;

        let out_id = self.ids.generate(self.clock.now());
        let work = WorkDir::create(self.compact_dir.join(out_id.to_string())).await?;
        log_info!(
            component = "compactor",
            event = "group_compaction_started",
            group = group.key(),
            output = %out_id,
            inputs = plan.len(),
        );

        let mut inputs = Vec::with_capacity(plan.len());
        for meta in &plan {
            let dir = work.path().join(meta.ulid.to_string());
            block::download(self.bkt.as_ref(), &meta.ulid, &dir).await?;
            inputs.push(verify_block(&dir, meta, self.accept_malformed_index).await?);
        }

        let merger = Arc::clone(&self.merger);
        let merged = tokio::task::spawn_blocking(move || merger.merge(inputs))
            .await
            .map_err(|err| CompactError::invariant(format!("merge task failed: {err}")))?;

        let vertical = plan
            .iter()
            .enumerate()
            .any(|(i, a)| plan[i + 1..].iter().any(|b| a.overlaps(b)));

        if merged.is_empty() {
            log_info!(
                component = "compactor",
                event = "empty_compaction_result",
                group = group.key(),
                inputs = plan.len(),
            );
        } else {
            let mut out = output_meta(out_id, group, &plan);
            if !self.vertical {
                self.check_output_overlap(group, &plan, &out)?;
            }
            let out_dir = work.path().join(out_id.to_string());
            block::write_local(&out_dir, &mut out, &merged).await?;
            block::upload(self.bkt.as_ref(), &out_dir)
                .await
                .with_context(|| format!("upload of compacted block {out_id}"))?;
            log_info!(
                component = "compactor",
                event = "compacted_block_uploaded",
                group = group.key(),
                block = %out_id,
                level = out.level(),
                min_time = out.min_time,
                max_time = out.max_time,
                samples = out.stats.num_samples,
            );
        }

        for meta in &plan {
            let marked = block::mark_for_deletion(self.bkt.as_ref(), &meta.ulid, self.clock.now())
                .await
                .retry()
                .with_context(|| format!("mark compacted input {}", meta.ulid))?;
            if marked {
                self.metrics.record_marked_for_deletion();
            }
        }
        self.metrics.record_group_compaction(vertical);
        Ok(true)
    }

    fn check_output_overlap(
        &self,
        group: &Group,
        plan: &[Meta],
        out: &Meta,
    ) -> Result<(), CompactError> {
        let planned: BTreeSet<BlockId> = plan.iter().map(|m| m.ulid).collect();
        let clashing: Vec<BlockId> = group
            .metas()
            .iter()
            .filter(|m| !m.is_marked() && !planned.contains(&m.ulid) && m.overlaps(out))
            .map(|m| m.ulid)
            .collect();
        if clashing.is_empty() {
            return Ok(());
        }
        Err(CompactError::halt(ErrorCause::Overlap {
            group: group.key().to_string(),
            blocks: clashing,
        })
        .context(format!("compacted block {} overlaps existing blocks", out.ulid)))
    }
}

fn check_disjoint_sources(plan: &[Meta]) -> Result<(), CompactError> {
    let mut seen = BTreeSet::new();
    for meta in plan {
        for source in &meta.compaction.sources {
            if !seen.insert(*source) {
                return Err(CompactError::invariant(format!(
                    "source {source} appears in more than one planned block"
                )));
            }
        }
    }
    Ok(())
}

fn output_meta(id: BlockId, group: &Group, plan: &[Meta]) -> Meta {
    let sources: BTreeSet<BlockId> = plan
        .iter()
        .flat_map(|m| m.compaction.sources.iter().copied())
        .collect();
    Meta {
        ulid: id,
        min_time: plan.iter().map(|m| m.min_time).min().unwrap_or_default(),
        max_time: plan.iter().map(|m| m.max_time).max().unwrap_or_default(),
        stats: Default::default(),
        compaction: CompactionMeta {
            level: plan.iter().map(Meta::level).max().unwrap_or(0) + 1,
            sources: sources.into_iter().collect(),
            parents: plan.iter().map(Meta::desc).collect(),
        },
        version: block::meta::META_VERSION,
        ext: ExtMeta {
            labels: group.labels().clone(),
            downsample: Downsample {
                resolution: group.resolution(),
            },
            source: BlockSource::Compactor,
            files: Vec::new(),
        },
        deletion_mark: None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;
    use ulid::Ulid;

    use super::*;
    use crate::{
        bucket::ObjectStoreBucket,
        clock::ManualClock,
        compaction::{merge::ConcatMerger, planner::LeveledPlanner},
        labels::Labels,
        option::{CompactorOptions, DEFAULT_COMPACTION_RANGES},
        test_util::{put_block, put_block_with},
    };

    const H: i64 = 3_600_000;

    struct Fixture {
        _tmp: TempDir,
        bkt: Arc<ObjectStoreBucket>,
        metrics: Arc<CompactorMetrics>,
        compactor: BucketCompactor,
        syncer: Arc<Syncer>,
    }

    fn fixture(clock: Arc<ManualClock>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let bkt = Arc::new(ObjectStoreBucket::in_memory("test"));
        let metrics = Arc::new(CompactorMetrics::new());
        let opts = CompactorOptions::from(tmp.path());
        let syncer = Arc::new(
            Syncer::from_options(&opts, bkt.clone(), clock.clone(), metrics.clone(), None)
                .unwrap(),
        );
        let compactor = BucketCompactor::new(
            syncer.clone(),
            bkt.clone(),
            Arc::new(LeveledPlanner::new(DEFAULT_COMPACTION_RANGES.to_vec(), false)),
            Arc::new(ConcatMerger),
            clock,
            Arc::new(BlockIdGenerator::new()),
            metrics.clone(),
            BucketCompactorConfig {
                compact_dir: opts.compact_dir(),
                concurrency: 1,
                vertical: false,
                accept_malformed_index: false,
            },
        );
        Fixture {
            _tmp: tmp,
            bkt,
            metrics,
            compactor,
            syncer,
        }
    }

    fn old_meta(created: SystemTime, min: i64, max: i64) -> Meta {
        Meta::new(Ulid::from_datetime(created), min, max, Labels::new())
    }

    #[tokio::test]
    async fn corrupted_input_halts_and_cleans_up() {
        let now = SystemTime::now();
        let clock = Arc::new(ManualClock::new(now));
        let fx = fixture(clock);
        let created = now - Duration::from_secs(3 * 3600);
        let good = old_meta(created, 0, 2 * H);
        put_block(fx.bkt.as_ref(), &good).await;
        let mut lying = old_meta(created + Duration::from_secs(1), 2 * H, 4 * H);
        put_block_with(fx.bkt.as_ref(), &mut lying, |meta| {
            meta.stats.num_samples += 7;
        })
        .await;

        let err = fx.compactor.compact().await.unwrap_err();
        assert!(err.is_halt(), "{err}");
        assert!(matches!(err.cause(), ErrorCause::UnhealthyBlock { id, .. } if *id == lying.ulid));
        assert!(block::read_deletion_mark(fx.bkt.as_ref(), &good.ulid)
            .await
            .unwrap()
            .is_none());
        let leftovers = std::fs::read_dir(&fx.compactor.compact_dir).unwrap().count();
        assert_eq!(leftovers, 0);
        assert_eq!(fx.metrics.snapshot().group_compaction_failures, 1);
    }

    #[tokio::test]
    async fn empty_merge_retires_inputs_without_output() {
        let now = SystemTime::now();
        let clock = Arc::new(ManualClock::new(now));
        let fx = fixture(clock);
        let created = now - Duration::from_secs(3 * 3600);
        let mut a = old_meta(created, 0, H);
        let mut b = old_meta(created + Duration::from_secs(1), H, 2 * H);
        for meta in [&mut a, &mut b] {
            crate::test_util::put_empty_block(fx.bkt.as_ref(), meta).await;
        }

        fx.compactor.compact().await.unwrap();
        fx.syncer.sync_metas().await.unwrap();
        let marks = fx.syncer.deletion_marks().await;
        assert!(marks.contains_key(&a.ulid) && marks.contains_key(&b.ulid));
        assert!(fx.syncer.metas().await.values().all(|m| m.is_marked()));
        assert_eq!(fx.metrics.snapshot().group_compactions, 1);
    }

    #[test]
    fn overlapping_sources_are_rejected() {
        let shared = Ulid::new();
        let mut a = Meta::new(Ulid::new(), 0, H, Labels::new());
        a.compaction.sources = vec![shared];
        let mut b = Meta::new(Ulid::new(), H, 2 * H, Labels::new());
        b.compaction.sources = vec![shared, Ulid::new()];
        assert!(check_disjoint_sources(&[a, b]).unwrap_err().is_halt());
    }
}
