//! Derivation of coarser-resolution blocks.
//!
//! Raw blocks become 5-minute blocks once they span 40 hours, 5-minute blocks
//! become 1-hour blocks once they span 10 days. A block is skipped when the
//! next resolution already holds blocks covering all of its sources, so
//! running a pass twice over the same state does nothing the second time.

/// Window aggregation of samples.
pub mod aggr;

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use crate::{
    block::{self, BlockSource, Downsample, Meta},
    bucket::Bucket,
    clock::Clock,
    compaction::{
        compactor::{reset_dir, verify_block, WorkDir},
        Syncer,
    },
    error::{CompactError, ResultExt},
    id::{BlockId, BlockIdGenerator},
    metrics::CompactorMetrics,
    observability::{log_debug, log_info},
    option::ResolutionLevel,
};

pub use self::aggr::downsample;

/// Passes run per iteration; the second sees the output of the first.
pub const DOWNSAMPLE_PASSES: usize = 2;

/// Downsamples eligible blocks of the syncer's view.
#[derive(Debug)]
pub struct Downsampler {
    syncer: Arc<Syncer>,
    bkt: Arc<dyn Bucket>,
    clock: Arc<dyn Clock>,
    ids: Arc<BlockIdGenerator>,
    metrics: Arc<CompactorMetrics>,
    dir: PathBuf,
    accept_malformed_index: bool,
}

impl Downsampler {
    /// Downsampler working below `dir`.
    pub fn new(
        syncer: Arc<Syncer>,
        bkt: Arc<dyn Bucket>,
        clock: Arc<dyn Clock>,
        ids: Arc<BlockIdGenerator>,
        metrics: Arc<CompactorMetrics>,
        dir: PathBuf,
        accept_malformed_index: bool,
    ) -> Self {
        Self {
            syncer,
            bkt,
            clock,
            ids,
            metrics,
            dir,
            accept_malformed_index,
        }
    }

    /// Run [`DOWNSAMPLE_PASSES`] passes, re-syncing before each. Returns the
    /// number of blocks produced.
    pub async fn run(&self) -> Result<usize, CompactError> {
        reset_dir(&self.dir).await?;
        let mut produced = 0;
        for pass in 0..DOWNSAMPLE_PASSES {
            self.syncer
                .sync_metas()
                .await
                .with_context(|| format!("sync before downsample pass {}", pass + 1))?;
            produced += self.run_pass().await?;
        }
        Ok(produced)
    }

    /// One pass over the current view.
    pub async fn run_pass(&self) -> Result<usize, CompactError> {
        let metas = self.syncer.metas().await;
        let candidates = select_candidates(metas.values());
        log_debug!(
            component = "downsample",
            event = "downsample_pass_started",
            candidates = candidates.len(),
        );
        let mut produced = 0;
        for (meta, target) in candidates {
            let result = self.downsample_block(&meta, target).await;
            self.metrics.record_downsample(result.is_ok());
            result.with_context(|| format!("downsample block {}", meta.ulid))?;
            produced += 1;
        }
        Ok(produced)
    }

    async fn downsample_block(
        &self,
        meta: &Meta,
        target: ResolutionLevel,
    ) -> Result<BlockId, CompactError> {
        let out_id = self.ids.generate(self.clock.now());
        let work = WorkDir::create(self.dir.join(out_id.to_string())).await?;

        let in_dir = work.path().join(meta.ulid.to_string());
        block::download(self.bkt.as_ref(), &meta.ulid, &in_dir).await?;
        let data = verify_block(&in_dir, meta, self.accept_malformed_index).await?;

        let resolution = target.millis();
        let aggregated = tokio::task::spawn_blocking(move || downsample(&data, resolution))
            .await
            .map_err(|err| CompactError::invariant(format!("downsample task failed: {err}")))?;

        let mut out = meta.clone();
        out.ulid = out_id;
        out.deletion_mark = None;
        out.ext.downsample = Downsample { resolution };
        out.ext.source = BlockSource::Downsampler;

        let out_dir = work.path().join(out_id.to_string());
        block::write_local(&out_dir, &mut out, &aggregated).await?;
        block::upload(self.bkt.as_ref(), &out_dir)
            .await
            .with_context(|| format!("upload of downsampled block {out_id}"))?;
        log_info!(
            component = "downsample",
            event = "block_downsampled",
            source_block = %meta.ulid,
            block = %out_id,
            resolution,
            samples = out.stats.num_samples,
        );
        Ok(out_id)
    }
}

/// Blocks to downsample next, paired with their target resolution.
fn select_candidates<'a>(
    metas: impl IntoIterator<Item = &'a Meta> + Clone,
) -> Vec<(Meta, ResolutionLevel)> {
    let mut covered: [HashSet<BlockId>; 3] = Default::default();
    for meta in metas.clone() {
        if let Some(level) = meta.resolution_level() {
            covered[level as usize].extend(meta.compaction.sources.iter().copied());
        }
    }

    let mut candidates = Vec::new();
    for meta in metas {
        if meta.is_marked() || meta.level() <= 1 {
            continue;
        }
        let Some(current) = meta.resolution_level() else {
            continue;
        };
        let (Some(target), Some(span)) = (current.next(), current.downsample_span()) else {
            continue;
        };
        if meta.max_time - meta.min_time < span {
            continue;
        }
        let done = &covered[target as usize];
        if meta.compaction.sources.iter().all(|s| done.contains(s)) {
            continue;
        }
        candidates.push((meta.clone(), target));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;
    use ulid::Ulid;

    use super::*;
    use crate::{
        bucket::ObjectStoreBucket, clock::ManualClock, labels::Labels, option::CompactorOptions,
        test_util::put_block,
    };

    const H: i64 = 3_600_000;

    fn compacted(min: i64, max: i64, created: SystemTime) -> Meta {
        let mut meta = Meta::new(Ulid::from_datetime(created), min, max, Labels::new());
        meta.compaction.level = 2;
        meta.compaction.sources = vec![Ulid::new(), Ulid::new()];
        meta
    }

    #[test]
    fn selects_by_span_level_and_coverage() {
        let now = SystemTime::now();
        let long = compacted(0, 40 * H, now);
        let short = compacted(0, 39 * H, now);
        let level_one = Meta::new(Ulid::new(), 0, 48 * H, Labels::new());
        let done = compacted(0, 48 * H, now);
        let mut done_5m = done.clone();
        done_5m.ulid = Ulid::new();
        done_5m.ext.downsample.resolution = ResolutionLevel::FiveMinutes.millis();

        let metas = [long.clone(), short, level_one, done, done_5m];
        let picked: Vec<(BlockId, ResolutionLevel)> = select_candidates(metas.iter())
            .into_iter()
            .map(|(m, r)| (m.ulid, r))
            .collect();
        assert_eq!(picked, vec![(long.ulid, ResolutionLevel::FiveMinutes)]);
    }

    #[tokio::test]
    async fn second_run_over_same_state_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let now = SystemTime::now();
        let clock = Arc::new(ManualClock::new(now));
        let bkt = Arc::new(ObjectStoreBucket::in_memory("test"));
        let input = compacted(0, 48 * H, now - Duration::from_secs(3 * 3600));
        put_block(bkt.as_ref(), &input).await;

        let opts = CompactorOptions::from(tmp.path());
        let metrics = Arc::new(CompactorMetrics::new());
        let syncer = Arc::new(
            Syncer::from_options(&opts, bkt.clone(), clock.clone(), metrics.clone(), None)
                .unwrap(),
        );
        let downsampler = Downsampler::new(
            syncer.clone(),
            bkt.clone(),
            clock,
            Arc::new(BlockIdGenerator::new()),
            metrics.clone(),
            opts.downsample_dir(),
            false,
        );

        assert_eq!(downsampler.run().await.unwrap(), 1);
        syncer.sync_metas().await.unwrap();
        let metas = syncer.metas().await;
        let out = metas
            .values()
            .find(|m| m.resolution() == ResolutionLevel::FiveMinutes.millis())
            .unwrap();
        assert_eq!(out.compaction.sources, input.compaction.sources);
        assert_eq!((out.min_time, out.max_time), (input.min_time, input.max_time));
        assert_eq!(out.ext.source, BlockSource::Downsampler);

        assert_eq!(downsampler.run().await.unwrap(), 0);
        assert_eq!(metrics.snapshot().downsamples, 1);
    }
}
