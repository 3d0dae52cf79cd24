//! The compaction run loop.
//!
//! One iteration cleans what expired since the last one, compacts, runs the
//! two downsampling passes, applies retention and cleans again. In wait mode
//! iterations repeat every `wait_interval` and a global view of the bucket is
//! refreshed alongside.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    bucket::Bucket,
    clock::{Clock, SystemClock},
    compaction::{
        apply_retention_policy, best_effort_clean_aborted_partial_uploads,
        compactor::reset_dir, BlocksCleaner, BucketCompactor, BucketCompactorConfig,
        ConcatMerger, LeveledPlanner, Syncer,
    },
    downsample::Downsampler,
    error::{CompactError, ResultExt},
    fetcher::{BlocksView, MetaFetcher},
    id::BlockIdGenerator,
    metrics::CompactorMetrics,
    observability::{log_debug, log_error, log_info, log_warn},
    option::CompactorOptions,
};

const GLOBAL_VIEW_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How [`CompactRunner::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Single-pass mode completed its iteration.
    Finished,
    /// Cancelled before or during an iteration.
    Cancelled,
    /// A halt-class error stopped work in wait mode and the runner stayed
    /// parked until cancelled.
    Halted,
}

/// Health indicators published by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Set once a halt-class error occurred.
    pub halted: bool,
    /// Iterations that failed with a retry-class error.
    pub retried: u64,
    /// Iterations completed successfully.
    pub iterations: u64,
}

/// Wires every stage together and drives iterations.
#[derive(Debug)]
pub struct CompactRunner {
    opts: CompactorOptions,
    bkt: Arc<dyn Bucket>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CompactorMetrics>,
    syncer: Arc<Syncer>,
    compactor: BucketCompactor,
    downsampler: Downsampler,
    cleaner: BlocksCleaner,
    loaded_view: Arc<BlocksView>,
    global_view: Arc<BlocksView>,
    status: watch::Sender<StatusReport>,
}

impl CompactRunner {
    /// Runner on the system clock.
    pub fn new(opts: CompactorOptions, bkt: Arc<dyn Bucket>) -> Result<Self, CompactError> {
        Self::with_clock(opts, bkt, Arc::new(SystemClock))
    }

    /// Runner on a caller supplied clock.
    pub fn with_clock(
        opts: CompactorOptions,
        bkt: Arc<dyn Bucket>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CompactError> {
        opts.validate().context("invalid compactor options")?;
        let ranges = opts.compaction_ranges()?;
        let vertical = opts.vertical_compaction();

        let metrics = Arc::new(CompactorMetrics::new());
        metrics.set_delete_delay(opts.delete_delay);
        let ids = Arc::new(BlockIdGenerator::new());
        let loaded_view = BlocksView::new("loaded");
        let global_view = BlocksView::new("global");

        let syncer = Arc::new(Syncer::from_options(
            &opts,
            Arc::clone(&bkt),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            Some(loaded_view.observer()),
        )?);
        let compactor = BucketCompactor::new(
            Arc::clone(&syncer),
            Arc::clone(&bkt),
            Arc::new(LeveledPlanner::new(ranges, vertical)),
            Arc::new(ConcatMerger),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&metrics),
            BucketCompactorConfig {
                compact_dir: opts.compact_dir(),
                concurrency: opts.compaction_concurrency,
                vertical,
                accept_malformed_index: opts.accept_malformed_index,
            },
        );
        let downsampler = Downsampler::new(
            Arc::clone(&syncer),
            Arc::clone(&bkt),
            Arc::clone(&clock),
            ids,
            Arc::clone(&metrics),
            opts.downsample_dir(),
            opts.accept_malformed_index,
        );
        let cleaner = BlocksCleaner::new(
            Arc::clone(&bkt),
            opts.delete_delay,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        );
        let (status, _) = watch::channel(StatusReport::default());

        Ok(Self {
            opts,
            bkt,
            clock,
            metrics,
            syncer,
            compactor,
            downsampler,
            cleaner,
            loaded_view,
            global_view,
            status,
        })
    }

    /// Counters shared by every stage.
    pub fn metrics(&self) -> &Arc<CompactorMetrics> {
        &self.metrics
    }

    /// Blocks seen by the compactor's filtered fetcher.
    pub fn loaded_view(&self) -> &Arc<BlocksView> {
        &self.loaded_view
    }

    /// Every block in the bucket, refreshed in wait mode.
    pub fn global_view(&self) -> &Arc<BlocksView> {
        &self.global_view
    }

    /// Current health indicators.
    pub fn status(&self) -> StatusReport {
        *self.status.borrow()
    }

    /// Receiver notified on every health indicator change.
    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.subscribe()
    }

    /// Run one full iteration.
    pub async fn run_once(&self) -> Result<(), CompactError> {
        self.syncer
            .sync_metas()
            .await
            .context("sync before cleanup")?;
        self.clean().await;

        self.compactor.compact().await.context("compaction")?;

        if self.opts.disable_downsampling {
            log_debug!(component = "runner", event = "downsampling_disabled");
        } else {
            self.downsampler.run().await.context("downsampling")?;
        }

        self.syncer
            .sync_metas()
            .await
            .context("sync before retention")?;
        apply_retention_policy(
            self.bkt.as_ref(),
            &self.syncer.metas().await,
            &self.opts.retention,
            self.clock.as_ref(),
            &self.metrics,
        )
        .await
        .context("retention")?;

        self.syncer
            .sync_metas()
            .await
            .context("sync after retention")?;
        self.clean().await;
        Ok(())
    }

    async fn clean(&self) {
        let marks = self.syncer.deletion_marks().await;
        let deleted = self.cleaner.delete_marked_blocks(&marks).await;
        let partial = self.syncer.partial().await;
        let aborted = best_effort_clean_aborted_partial_uploads(
            self.bkt.as_ref(),
            &partial,
            self.opts.partial_upload_threshold(),
            self.clock.as_ref(),
            &self.metrics,
        )
        .await;
        log_debug!(
            component = "runner",
            event = "cleanup_finished",
            deleted,
            aborted,
        );
    }

    /// Run until done: one iteration in single-pass mode, forever in wait
    /// mode. Returns the error of the iteration that stopped the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome, CompactError> {
        reset_dir(&self.opts.downsample_dir()).await?;
        if !self.opts.wait {
            return self.run_loop(&cancel).await;
        }
        let refresh_stop = cancel.child_token();
        let (outcome, ()) = tokio::join!(
            async {
                let outcome = self.run_loop(&cancel).await;
                refresh_stop.cancel();
                outcome
            },
            self.refresh_global_view(&refresh_stop),
        );
        outcome
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<RunOutcome, CompactError> {
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                result = self.run_once() => result,
            };
            match result {
                Ok(()) => {
                    self.metrics.record_iteration();
                    self.status.send_modify(|s| s.iterations += 1);
                    log_info!(component = "runner", event = "iteration_finished");
                }
                Err(err) if err.is_halt() => {
                    self.metrics.set_halted(true);
                    self.status.send_modify(|s| s.halted = true);
                    log_error!(
                        component = "runner",
                        event = "compactor_halted",
                        error = %err,
                    );
                    if !self.opts.wait || !self.opts.halt_on_error {
                        return Err(err);
                    }
                    cancel.cancelled().await;
                    return Ok(RunOutcome::Halted);
                }
                Err(err) if err.is_retry() => {
                    self.metrics.record_retry();
                    self.status.send_modify(|s| s.retried += 1);
                    log_warn!(
                        component = "runner",
                        event = "iteration_retry",
                        error = %err,
                    );
                    if !self.opts.wait {
                        return Err(err);
                    }
                }
                Err(err) => {
                    log_error!(
                        component = "runner",
                        event = "iteration_failed",
                        error = %err,
                    );
                    return Err(err);
                }
            }
            if !self.opts.wait {
                return Ok(RunOutcome::Finished);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                _ = tokio::time::sleep(self.opts.wait_interval) => {}
            }
        }
    }

    async fn refresh_global_view(&self, stop: &CancellationToken) {
        let fetcher = MetaFetcher::new(
            Arc::clone(&self.bkt),
            Arc::clone(&self.clock),
            self.opts.block_sync_concurrency,
        )
        .with_observer(self.global_view.observer());
        loop {
            let fetched = tokio::select! {
                _ = stop.cancelled() => return,
                fetched = fetcher.fetch() => fetched,
            };
            let delay = match fetched {
                Ok(state) => {
                    log_debug!(
                        component = "runner",
                        event = "global_view_refreshed",
                        blocks = state.metas.len(),
                    );
                    self.opts.global_view_refresh
                }
                Err(err) => {
                    log_warn!(
                        component = "runner",
                        event = "global_view_refresh_failed",
                        error = %err,
                    );
                    GLOBAL_VIEW_RETRY_INTERVAL
                }
            };
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use tempfile::TempDir;

    use super::*;
    use crate::{bucket::ObjectStoreBucket, clock::ManualClock};

    #[tokio::test]
    async fn cancelled_before_start() {
        let tmp = TempDir::new().unwrap();
        let runner = CompactRunner::with_clock(
            CompactorOptions::from(tmp.path()).wait(true),
            Arc::new(ObjectStoreBucket::in_memory("test")),
            Arc::new(ManualClock::new(SystemTime::now())),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(runner.run(cancel).await.unwrap(), RunOutcome::Cancelled);
        assert_eq!(runner.status(), StatusReport::default());
    }

    #[tokio::test]
    async fn empty_bucket_finishes_single_pass() {
        let tmp = TempDir::new().unwrap();
        let runner = CompactRunner::new(
            CompactorOptions::from(tmp.path()),
            Arc::new(ObjectStoreBucket::in_memory("test")),
        )
        .unwrap();
        let mut updates = runner.subscribe();
        assert_eq!(
            runner.run(CancellationToken::new()).await.unwrap(),
            RunOutcome::Finished
        );
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().iterations, 1);
        assert_eq!(runner.metrics().snapshot().iterations, 1);
        assert!(runner.loaded_view().snapshot().refreshed_at.is_some());
    }

    #[test]
    fn rejects_invalid_options() {
        let err = CompactRunner::new(
            CompactorOptions::from("/unused").max_compaction_level(9),
            Arc::new(ObjectStoreBucket::in_memory("test")),
        )
        .unwrap_err();
        assert!(!err.is_retry());
    }
}
