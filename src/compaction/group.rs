use std::collections::BTreeMap;

use crate::{block::Meta, labels::Labels};

/// Blocks sharing external labels and resolution, compacted as one unit.
#[derive(Debug, Clone)]
pub struct Group {
    key: String,
    labels: Labels,
    resolution: i64,
    metas: Vec<Meta>,
}

/// Key of the group `meta` belongs to: `<resolution>@<label hash>`.
pub fn group_key(meta: &Meta) -> String {
    format!("{}@{}", meta.resolution(), meta.ext.labels.hash32())
}

impl Group {
    fn new(key: String, labels: Labels, resolution: i64) -> Self {
        Self {
            key,
            labels,
            resolution,
            metas: Vec::new(),
        }
    }

    /// Group key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Shared external labels.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Shared resolution in milliseconds.
    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    /// Members ordered by min time, then level descending.
    pub fn metas(&self) -> &[Meta] {
        &self.metas
    }
}

/// Partition `metas` into groups ordered by key.
pub fn group_metas<'a>(metas: impl IntoIterator<Item = &'a Meta>) -> Vec<Group> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for meta in metas {
        let key = group_key(meta);
        groups
            .entry(key.clone())
            .or_insert_with(|| Group::new(key, meta.ext.labels.clone(), meta.resolution()))
            .metas
            .push(meta.clone());
    }
    let mut groups: Vec<Group> = groups.into_values().collect();
    for group in &mut groups {
        group
            .metas
            .sort_by(|a, b| a.min_time.cmp(&b.min_time).then(b.level().cmp(&a.level())));
    }
    groups
}
