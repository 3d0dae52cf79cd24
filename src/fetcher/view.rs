use std::{
    fmt,
    sync::{Arc, RwLock},
    time::SystemTime,
};

use super::Observer;
use crate::{block::Meta, error::CompactError};

/// Point-in-time copy of a [`BlocksView`].
#[derive(Debug, Clone, Default)]
pub struct BlocksViewSnapshot {
    /// Name of the view, e.g. `loaded` or `global`.
    pub label: String,
    /// Blocks from the last successful fetch.
    pub blocks: Vec<Meta>,
    /// When the view was last updated.
    pub refreshed_at: Option<SystemTime>,
    /// Error of the last failed fetch, cleared by the next success.
    pub err: Option<String>,
}

/// Latest block list observed by a fetcher, readable from any thread.
pub struct BlocksView {
    inner: RwLock<BlocksViewSnapshot>,
}

impl fmt::Debug for BlocksView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("BlocksView")
            .field("label", &snapshot.label)
            .field("blocks", &snapshot.blocks.len())
            .finish()
    }
}

impl BlocksView {
    /// Empty view named `label`.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(BlocksViewSnapshot {
                label: label.into(),
                ..BlocksViewSnapshot::default()
            }),
        })
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> BlocksViewSnapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Record a fetch outcome. A failure keeps the previous block list.
    pub fn update(&self, blocks: &[Meta], err: Option<&CompactError>, now: SystemTime) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match err {
            Some(err) => guard.err = Some(err.to_string()),
            None => {
                guard.blocks = blocks.to_vec();
                guard.err = None;
            }
        }
        guard.refreshed_at = Some(now);
    }

    /// Fetcher observer feeding this view.
    pub fn observer(self: &Arc<Self>) -> Observer {
        let view = Arc::clone(self);
        Arc::new(move |blocks: &[Meta], err: Option<&CompactError>| {
            view.update(blocks, err, SystemTime::now())
        })
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::{error::ErrorCause, labels::Labels};

    #[test]
    fn failures_keep_previous_blocks() {
        let view = BlocksView::new("loaded");
        let observer = view.observer();
        let meta = Meta::new(Ulid::new(), 0, 10, Labels::new());
        observer(&[meta.clone()], None);
        let err = CompactError::retry(ErrorCause::Invariant("list failed".into()));
        observer(&[], Some(&err));

        let snapshot = view.snapshot();
        assert_eq!(snapshot.label, "loaded");
        assert_eq!(snapshot.blocks, vec![meta]);
        assert!(snapshot.err.unwrap().contains("list failed"));
        assert!(snapshot.refreshed_at.is_some());
    }
}
