use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::deletion_mark::DeletionMark;
use crate::{bucket::BucketError, id::BlockId, labels::Labels, option::ResolutionLevel};

/// Only meta format understood by this crate.
pub const META_VERSION: u32 = 1;

/// Errors reading, writing or validating a meta or deletion-mark record.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Bucket access failed.
    #[error(transparent)]
    Bucket(#[from] BucketError),
    /// The record is not valid JSON of the expected shape.
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    /// The record parsed but is semantically invalid.
    #[error("invalid meta for block {id}: {reason}")]
    Invalid {
        /// Block the meta belongs to.
        id: BlockId,
        /// What is wrong with it.
        reason: String,
    },
}

impl MetaError {
    /// Returns `true` when the record simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::Bucket(err) if err.is_not_found())
    }
}

/// Per-block statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    /// Number of stored rows.
    #[serde(default)]
    pub num_samples: u64,
    /// Number of distinct series.
    #[serde(default)]
    pub num_series: u64,
    /// Number of 120-sample chunks.
    #[serde(default)]
    pub num_chunks: u64,
}

/// Short description of a parent block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDesc {
    /// Parent id.
    pub ulid: BlockId,
    /// Parent min time.
    pub min_time: i64,
    /// Parent max time.
    pub max_time: i64,
}

/// Compaction lineage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionMeta {
    /// 1 for ingested blocks, max input level + 1 for merged ones.
    pub level: u32,
    /// Ingested blocks whose data this block contains.
    pub sources: Vec<BlockId>,
    /// Blocks merged directly into this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<BlockDesc>,
}

/// Who produced a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockSource {
    /// Written by an ingesting component.
    #[default]
    Ingest,
    /// Output of compaction.
    Compactor,
    /// Output of downsampling.
    Downsampler,
}

/// Downsampling information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downsample {
    /// Resolution in milliseconds, 0 for raw.
    pub resolution: i64,
}

/// File belonging to a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFile {
    /// Path relative to the block directory.
    pub rel_path: String,
    /// Size in bytes.
    #[serde(default)]
    pub size_bytes: u64,
}

/// Extension section: partitioning labels, resolution, origin and files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtMeta {
    /// External labels partitioning the block.
    #[serde(default)]
    pub labels: Labels,
    /// Resolution.
    #[serde(default)]
    pub downsample: Downsample,
    /// Producer.
    #[serde(default)]
    pub source: BlockSource,
    /// Data files, excluding `meta.json` and the deletion mark.
    #[serde(default)]
    pub files: Vec<BlockFile>,
}

/// Durable descriptor of a block, stored as `<id>/meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Block id.
    pub ulid: BlockId,
    /// Inclusive lower bound in milliseconds.
    pub min_time: i64,
    /// Exclusive upper bound in milliseconds.
    pub max_time: i64,
    /// Statistics.
    #[serde(default)]
    pub stats: BlockStats,
    /// Lineage.
    pub compaction: CompactionMeta,
    /// Format version.
    pub version: u32,
    /// Extension section.
    #[serde(default)]
    pub ext: ExtMeta,
    /// Deletion mark observed during the last sync. Never serialized.
    #[serde(skip)]
    pub deletion_mark: Option<DeletionMark>,
}

impl Meta {
    /// Level-1 meta for a freshly ingested block.
    pub fn new(ulid: BlockId, min_time: i64, max_time: i64, labels: Labels) -> Self {
        Meta {
            ulid,
            min_time,
            max_time,
            stats: BlockStats::default(),
            compaction: CompactionMeta {
                level: 1,
                sources: vec![ulid],
                parents: Vec::new(),
            },
            version: META_VERSION,
            ext: ExtMeta {
                labels,
                ..ExtMeta::default()
            },
            deletion_mark: None,
        }
    }

    /// Resolution in milliseconds.
    pub fn resolution(&self) -> i64 {
        self.ext.downsample.resolution
    }

    /// Resolution as a known level.
    pub fn resolution_level(&self) -> Option<ResolutionLevel> {
        ResolutionLevel::from_millis(self.resolution())
    }

    /// Compaction level.
    pub fn level(&self) -> u32 {
        self.compaction.level
    }

    /// Sum of the listed file sizes.
    pub fn size_bytes(&self) -> u64 {
        self.ext.files.iter().map(|f| f.size_bytes).sum()
    }

    /// Returns `true` if a deletion mark was observed for this block.
    pub fn is_marked(&self) -> bool {
        self.deletion_mark.is_some()
    }

    /// Half-open range overlap.
    pub fn overlaps(&self, other: &Meta) -> bool {
        self.min_time < other.max_time && other.min_time < self.max_time
    }

    /// Parent descriptor of this block.
    pub fn desc(&self) -> BlockDesc {
        BlockDesc {
            ulid: self.ulid,
            min_time: self.min_time,
            max_time: self.max_time,
        }
    }

    /// Structural checks applied to every meta read from the bucket.
    pub fn validate(&self) -> Result<(), MetaError> {
        let invalid = |reason: String| MetaError::Invalid {
            id: self.ulid,
            reason,
        };
        if self.version != META_VERSION {
            return Err(invalid(format!("unsupported version {}", self.version)));
        }
        if self.min_time > self.max_time {
            return Err(invalid(format!(
                "min time {} after max time {}",
                self.min_time, self.max_time
            )));
        }
        if self.compaction.level == 0 {
            return Err(invalid("compaction level 0".to_string()));
        }
        if self.compaction.sources.is_empty() {
            return Err(invalid("no sources".to_string()));
        }
        if self.resolution_level().is_none() {
            return Err(invalid(format!("unknown resolution {}", self.resolution())));
        }
        Ok(())
    }

    /// Parse and validate a meta read from `<id>/meta.json`.
    pub fn from_json(id: BlockId, raw: &[u8]) -> Result<Self, MetaError> {
        let meta: Meta = serde_json::from_slice(raw)?;
        if meta.ulid != id {
            return Err(MetaError::Invalid {
                id,
                reason: format!("meta names block {}", meta.ulid),
            });
        }
        meta.validate()?;
        Ok(meta)
    }

    /// Pretty JSON encoding.
    pub fn to_json(&self) -> Result<Vec<u8>, MetaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
