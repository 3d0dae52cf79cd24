use std::{path::PathBuf, sync::OnceLock, time::Duration};

use regex::Regex;
use thiserror::Error;

use crate::relabel::RelabelConfig;

/// Blocks without a meta younger than this are assumed to be uploads in progress.
pub const PARTIAL_UPLOAD_THRESHOLD_AGE: Duration = Duration::from_secs(2 * 24 * 60 * 60);

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Compaction window ladder in milliseconds: 1h, 2h, 8h, 2d, 14d.
pub const DEFAULT_COMPACTION_RANGES: [i64; 5] = [
    HOUR_MS,
    2 * HOUR_MS,
    8 * HOUR_MS,
    48 * HOUR_MS,
    14 * 24 * HOUR_MS,
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum OptionError {
    /// Duration string did not parse.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    /// Max compaction level beyond the window ladder.
    #[error("max compaction level {level} exceeds the maximum of {max}")]
    MaxCompactionLevel {
        /// Configured level.
        level: usize,
        /// Highest supported level.
        max: usize,
    },
    /// A concurrency knob was set to zero.
    #[error("{0} must be greater than zero")]
    ZeroConcurrency(&'static str),
}

/// Sample resolution of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResolutionLevel {
    /// Raw samples.
    Raw,
    /// 5-minute aggregates.
    FiveMinutes,
    /// 1-hour aggregates.
    OneHour,
}

impl ResolutionLevel {
    /// Every resolution, finest first.
    pub const ALL: [ResolutionLevel; 3] = [
        ResolutionLevel::Raw,
        ResolutionLevel::FiveMinutes,
        ResolutionLevel::OneHour,
    ];

    /// Window width in milliseconds.
    pub fn millis(self) -> i64 {
        match self {
            ResolutionLevel::Raw => 0,
            ResolutionLevel::FiveMinutes => 5 * 60 * 1000,
            ResolutionLevel::OneHour => HOUR_MS,
        }
    }

    /// Resolution with the given window width.
    pub fn from_millis(millis: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|res| res.millis() == millis)
    }

    /// Next coarser resolution, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            ResolutionLevel::Raw => Some(ResolutionLevel::FiveMinutes),
            ResolutionLevel::FiveMinutes => Some(ResolutionLevel::OneHour),
            ResolutionLevel::OneHour => None,
        }
    }

    /// Minimum time span a block must cover before it is downsampled to
    /// [`ResolutionLevel::next`].
    pub fn downsample_span(self) -> Option<i64> {
        match self {
            ResolutionLevel::Raw => Some(40 * HOUR_MS),
            ResolutionLevel::FiveMinutes => Some(10 * 24 * HOUR_MS),
            ResolutionLevel::OneHour => None,
        }
    }
}

/// Maximum age per resolution. [`Duration::ZERO`] keeps blocks forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Retention of raw blocks.
    pub raw: Duration,
    /// Retention of 5-minute blocks.
    pub five_minutes: Duration,
    /// Retention of 1-hour blocks.
    pub one_hour: Duration,
}

impl RetentionPolicy {
    /// Retention for `resolution`.
    pub fn for_resolution(&self, resolution: ResolutionLevel) -> Duration {
        match resolution {
            ResolutionLevel::Raw => self.raw,
            ResolutionLevel::FiveMinutes => self.five_minutes,
            ResolutionLevel::OneHour => self.one_hour,
        }
    }
}

/// Compactor configuration, built from the local data directory.
///
/// Working directories `compact/` and `downsample/` are created beneath it.
#[derive(Debug, Clone)]
pub struct CompactorOptions {
    pub(crate) data_dir: PathBuf,
    pub(crate) block_sync_concurrency: usize,
    pub(crate) compaction_concurrency: usize,
    pub(crate) consistency_delay: Duration,
    pub(crate) delete_delay: Duration,
    pub(crate) retention: RetentionPolicy,
    pub(crate) max_compaction_level: usize,
    pub(crate) disable_downsampling: bool,
    pub(crate) dedup_replica_labels: Vec<String>,
    pub(crate) selector_relabel: Vec<RelabelConfig>,
    pub(crate) halt_on_error: bool,
    pub(crate) accept_malformed_index: bool,
    pub(crate) wait: bool,
    pub(crate) wait_interval: Duration,
    pub(crate) global_view_refresh: Duration,
}

impl<P> From<P> for CompactorOptions
where
    P: Into<PathBuf>,
{
    fn from(data_dir: P) -> Self {
        CompactorOptions {
            data_dir: data_dir.into(),
            block_sync_concurrency: 20,
            compaction_concurrency: 1,
            consistency_delay: Duration::from_secs(30 * 60),
            delete_delay: Duration::from_secs(48 * 60 * 60),
            retention: RetentionPolicy::default(),
            max_compaction_level: DEFAULT_COMPACTION_RANGES.len() - 1,
            disable_downsampling: false,
            dedup_replica_labels: Vec::new(),
            selector_relabel: Vec::new(),
            halt_on_error: true,
            accept_malformed_index: false,
            wait: false,
            wait_interval: Duration::from_secs(5 * 60),
            global_view_refresh: Duration::from_secs(60),
        }
    }
}

impl CompactorOptions {
    /// Change the local data directory.
    pub fn data_dir(self, data_dir: impl Into<PathBuf>) -> Self {
        CompactorOptions {
            data_dir: data_dir.into(),
            ..self
        }
    }

    /// Concurrent meta fetches per sync.
    pub fn block_sync_concurrency(self, block_sync_concurrency: usize) -> Self {
        CompactorOptions {
            block_sync_concurrency,
            ..self
        }
    }

    /// Groups compacted concurrently.
    pub fn compaction_concurrency(self, compaction_concurrency: usize) -> Self {
        CompactorOptions {
            compaction_concurrency,
            ..self
        }
    }

    /// Minimum age of an ingested block before it is considered.
    pub fn consistency_delay(self, consistency_delay: Duration) -> Self {
        CompactorOptions {
            consistency_delay,
            ..self
        }
    }

    /// Time between marking a block and deleting it.
    pub fn delete_delay(self, delete_delay: Duration) -> Self {
        CompactorOptions {
            delete_delay,
            ..self
        }
    }

    /// Per-resolution retention.
    pub fn retention(self, retention: RetentionPolicy) -> Self {
        CompactorOptions { retention, ..self }
    }

    /// Highest level compaction produces.
    pub fn max_compaction_level(self, max_compaction_level: usize) -> Self {
        CompactorOptions {
            max_compaction_level,
            ..self
        }
    }

    /// Skip the downsampling stage.
    pub fn disable_downsampling(self, disable_downsampling: bool) -> Self {
        CompactorOptions {
            disable_downsampling,
            ..self
        }
    }

    /// Labels that only differ between replicas. Setting any enables
    /// vertical compaction.
    pub fn dedup_replica_labels<I, S>(self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CompactorOptions {
            dedup_replica_labels: labels.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Relabel rules selecting which blocks this instance owns.
    pub fn selector_relabel(self, selector_relabel: Vec<RelabelConfig>) -> Self {
        CompactorOptions {
            selector_relabel,
            ..self
        }
    }

    /// Park instead of exiting on halt-class errors.
    pub fn halt_on_error(self, halt_on_error: bool) -> Self {
        CompactorOptions {
            halt_on_error,
            ..self
        }
    }

    /// Only warn when an input's stats disagree with its data.
    pub fn accept_malformed_index(self, accept_malformed_index: bool) -> Self {
        CompactorOptions {
            accept_malformed_index,
            ..self
        }
    }

    /// Keep running iterations until cancelled.
    pub fn wait(self, wait: bool) -> Self {
        CompactorOptions { wait, ..self }
    }

    /// Pause between iterations in wait mode.
    pub fn wait_interval(self, wait_interval: Duration) -> Self {
        CompactorOptions {
            wait_interval,
            ..self
        }
    }

    /// Refresh interval of the unfiltered global view.
    pub fn global_view_refresh(self, global_view_refresh: Duration) -> Self {
        CompactorOptions {
            global_view_refresh,
            ..self
        }
    }
}

impl CompactorOptions {
    pub(crate) fn compact_dir(&self) -> PathBuf {
        self.data_dir.join("compact")
    }

    pub(crate) fn downsample_dir(&self) -> PathBuf {
        self.data_dir.join("downsample")
    }

    pub(crate) fn vertical_compaction(&self) -> bool {
        !self.dedup_replica_labels.is_empty()
    }

    /// Age after which a block without a readable meta is removed.
    pub(crate) fn partial_upload_threshold(&self) -> Duration {
        PARTIAL_UPLOAD_THRESHOLD_AGE.max(self.consistency_delay)
    }

    /// Window ladder up to the configured max level.
    pub(crate) fn compaction_ranges(&self) -> Result<Vec<i64>, OptionError> {
        let max = DEFAULT_COMPACTION_RANGES.len() - 1;
        if self.max_compaction_level > max {
            return Err(OptionError::MaxCompactionLevel {
                level: self.max_compaction_level,
                max,
            });
        }
        Ok(DEFAULT_COMPACTION_RANGES[..=self.max_compaction_level].to_vec())
    }

    pub(crate) fn validate(&self) -> Result<(), OptionError> {
        if self.block_sync_concurrency == 0 {
            return Err(OptionError::ZeroConcurrency("block_sync_concurrency"));
        }
        if self.compaction_concurrency == 0 {
            return Err(OptionError::ZeroConcurrency("compaction_concurrency"));
        }
        self.compaction_ranges().map(|_| ())
    }
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(\d+)y)?(?:(\d+)w)?(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?(?:(\d+)ms)?$",
        )
        .expect("duration regex is valid")
    })
}

/// Parse a Prometheus-style duration such as `0d`, `48h`, `1w2d` or `500ms`.
pub fn parse_duration(input: &str) -> Result<Duration, OptionError> {
    let invalid = || OptionError::InvalidDuration(input.to_string());
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err(invalid());
    }
    let caps = duration_regex().captures(input).ok_or_else(invalid)?;
    const UNITS_MS: [u64; 7] = [
        365 * 24 * 60 * 60 * 1000,
        7 * 24 * 60 * 60 * 1000,
        24 * 60 * 60 * 1000,
        60 * 60 * 1000,
        60 * 1000,
        1000,
        1,
    ];
    let mut total: u64 = 0;
    for (idx, unit) in UNITS_MS.iter().enumerate() {
        if let Some(value) = caps.get(idx + 1) {
            let value: u64 = value.as_str().parse().map_err(|_| invalid())?;
            total = value
                .checked_mul(*unit)
                .and_then(|ms| total.checked_add(ms))
                .ok_or_else(invalid)?;
        }
    }
    Ok(Duration::from_millis(total))
}
