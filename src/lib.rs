#![deny(missing_docs)]
//! Compaction, downsampling and retention engine for time-series blocks held
//! in object storage.
//!
//! Blocks are immutable directories `<ulid>/` in a bucket, described by a
//! `meta.json` uploaded last. The engine discovers them, merges small blocks
//! of one group into larger ones, derives 5-minute and 1-hour aggregates,
//! marks blocks past their retention and finally deletes marked blocks once
//! the delete delay has passed. Object storage is the only source of truth;
//! every in-memory structure is rebuilt on each sync.
//!
//! [`CompactRunner`] wires the stages together; the stages are public for
//! callers that need a different sequence.

/// Block layout, metadata records and the upload/delete protocols.
pub mod block;
/// Object storage access.
pub mod bucket;
/// Wall-clock abstraction.
pub mod clock;
/// Grouping, planning, merging, retention and cleanup.
pub mod compaction;
/// Coarser-resolution block derivation.
pub mod downsample;
/// Halt/retry/unclassified error taxonomy.
pub mod error;
/// Metadata discovery and the filter chain.
pub mod fetcher;
/// Block identifiers.
pub mod id;
/// External label sets.
pub mod labels;
/// Compactor counters.
pub mod metrics;
mod observability;
/// Configuration.
pub mod option;
/// Label selector relabeling.
pub mod relabel;
/// The run loop.
pub mod runner;

#[cfg(test)]
mod test_util;

pub use crate::{
    block::{DeletionMark, Meta},
    bucket::{Bucket, BucketError, ObjectStoreBucket},
    clock::{Clock, ManualClock, SystemClock},
    error::{CompactError, ErrorCause, ErrorKind, ResultExt},
    id::BlockId,
    labels::Labels,
    metrics::{CompactorMetrics, CompactorMetricsSnapshot},
    option::{parse_duration, CompactorOptions, ResolutionLevel, RetentionPolicy},
    runner::{CompactRunner, RunOutcome, StatusReport},
};
