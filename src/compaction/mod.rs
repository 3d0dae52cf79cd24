//! Compaction orchestration: grouping, leveled planning, merging, retention
//! and deletion.
//!
//! The [`Syncer`] owns the view every stage works from; the
//! [`BucketCompactor`] turns groups into larger blocks and retires their
//! inputs, and the [`BlocksCleaner`] reclaims space once marks expire.

/// Physical deletion of marked blocks and aborted uploads.
pub mod cleaner;
/// Group compaction and its publish/retire protocol.
pub mod compactor;
/// Grouping by external labels and resolution.
pub mod group;
/// Sample merge routines.
pub mod merge;
/// Leveled compaction planning.
pub mod planner;
/// Age based deletion marking.
pub mod retention;
/// Metadata sync and garbage collection.
pub mod syncer;

pub use cleaner::{best_effort_clean_aborted_partial_uploads, BlocksCleaner};
pub use compactor::{BucketCompactor, BucketCompactorConfig};
pub use group::{group_key, group_metas, Group};
pub use merge::{BlockMerger, ConcatMerger};
pub use planner::{LeveledPlanner, Planner};
pub use retention::apply_retention_policy;
pub use syncer::Syncer;
