use std::{
    fmt,
    str::FromStr,
    sync::Mutex,
    time::{Duration, SystemTime},
};

use ulid::{Generator, Ulid};

/// Identifier of a block. Sorts by creation time.
pub type BlockId = Ulid;

/// Thread-safe ULID generator shared by every stage that produces blocks.
pub struct BlockIdGenerator {
    inner: Mutex<Generator>,
}

impl BlockIdGenerator {
    /// Create a new generator.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Produce the next [`BlockId`] stamped with `now`.
    ///
    /// Ids are monotonic even if `now` moves backwards.
    pub fn generate(&self, now: SystemTime) -> BlockId {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // The generator only fails when the random part overflows within one
        // millisecond; a fresh id is still unique.
        guard
            .generate_from_datetime(now)
            .unwrap_or_else(|_| Ulid::from_datetime(now))
    }
}

impl fmt::Debug for BlockIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockIdGenerator").finish_non_exhaustive()
    }
}

impl Default for BlockIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a block directory name such as `01HV.../` into its id.
pub fn parse_block_dir(name: &str) -> Option<BlockId> {
    let name = name.trim_end_matches('/');
    let name = name.rsplit('/').next().unwrap_or(name);
    Ulid::from_str(name).ok()
}

/// Age of a block id relative to `now`, based on the timestamp embedded in the id.
pub fn id_age(id: &BlockId, now: SystemTime) -> Duration {
    now.duration_since(id.datetime()).unwrap_or_default()
}
