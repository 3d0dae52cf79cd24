use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::meta::MetaError;
use crate::{clock::unix_secs, id::BlockId};

/// Only deletion-mark format understood by this crate.
pub const DELETION_MARK_VERSION: u32 = 1;

/// Recorded intent to delete a block, stored as `<id>/deletion-mark.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    /// Marked block.
    pub id: BlockId,
    /// Unix seconds at which the mark was written.
    pub deletion_time: i64,
    /// Format version.
    pub version: u32,
}

impl DeletionMark {
    /// Mark for `id` written at `now`.
    pub fn new(id: BlockId, now: SystemTime) -> Self {
        DeletionMark {
            id,
            deletion_time: unix_secs(now),
            version: DELETION_MARK_VERSION,
        }
    }

    /// Time the mark was written.
    pub fn marked_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.deletion_time.max(0) as u64)
    }

    /// Age of the mark at `now`; marks from the future have age zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.marked_at()).unwrap_or_default()
    }

    pub(crate) fn from_json(id: BlockId, raw: &[u8]) -> Result<Self, MetaError> {
        let mark: DeletionMark = serde_json::from_slice(raw)?;
        if mark.id != id {
            return Err(MetaError::Invalid {
                id,
                reason: format!("deletion mark names block {}", mark.id),
            });
        }
        if mark.version != DELETION_MARK_VERSION {
            return Err(MetaError::Invalid {
                id,
                reason: format!("unsupported deletion mark version {}", mark.version),
            });
        }
        Ok(mark)
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>, MetaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
