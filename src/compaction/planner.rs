//! Leveled compaction planner.
//!
//! Blocks are merged through a ladder of aligned time windows. A plan is the
//! first run of touching blocks, at the lowest window size, that fits one
//! aligned window and holds more than one block. A gap always ends a run, so
//! a block arriving late can never land inside an already merged range.

use std::fmt;

use super::group::Group;
use crate::{
    block::Meta,
    error::{CompactError, ErrorCause},
};

/// Picks the next set of blocks of a group to merge.
pub trait Planner: Send + Sync + fmt::Debug {
    /// Blocks to merge next; empty when the group has no work.
    fn plan(&self, group: &Group) -> Result<Vec<Meta>, CompactError>;
}

/// Leveled planner over a window ladder.
#[derive(Debug, Clone)]
pub struct LeveledPlanner {
    ranges: Vec<i64>,
    vertical: bool,
}

impl LeveledPlanner {
    /// Planner over `ranges` (milliseconds, ascending). With `vertical`,
    /// overlapping blocks are merged before anything else; without it,
    /// overlap is a halt-class error.
    pub fn new(ranges: Vec<i64>, vertical: bool) -> Self {
        Self { ranges, vertical }
    }
}

impl Planner for LeveledPlanner {
    fn plan(&self, group: &Group) -> Result<Vec<Meta>, CompactError> {
        // Marked blocks are already retired.
        let metas: Vec<&Meta> = group.metas().iter().filter(|m| !m.is_marked()).collect();
        if metas.len() < 2 {
            return Ok(Vec::new());
        }

        let overlapping = select_overlapping(&metas);
        if !overlapping.is_empty() {
            if !self.vertical {
                return Err(CompactError::halt(ErrorCause::Overlap {
                    group: group.key().to_string(),
                    blocks: overlapping.iter().map(|m| m.ulid).collect(),
                }));
            }
            return Ok(overlapping.into_iter().cloned().collect());
        }

        Ok(select_window(&self.ranges, &metas)
            .into_iter()
            .cloned()
            .collect())
    }
}

/// First run of mutually overlapping blocks. `metas` is sorted by min time.
fn select_overlapping<'a>(metas: &[&'a Meta]) -> Vec<&'a Meta> {
    let mut selected: Vec<&'a Meta> = Vec::new();
    let Some(first) = metas.first() else {
        return selected;
    };
    let mut global_max = first.max_time;
    for pair in metas.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        if cur.min_time < global_max {
            if selected.is_empty() {
                selected.push(prev);
            }
            selected.push(cur);
        } else if !selected.is_empty() {
            break;
        }
        global_max = global_max.max(cur.max_time);
    }
    selected
}

/// Split `metas` into runs that fit one window of width `range` aligned to
/// a multiple of `range`. Blocks wider than their window are skipped.
fn split_by_range<'a>(metas: &[&'a Meta], range: i64) -> Vec<Vec<&'a Meta>> {
    let mut parts = Vec::new();
    let mut i = 0;
    while i < metas.len() {
        let t0 = metas[i].min_time.div_euclid(range) * range;
        if metas[i].max_time > t0 + range {
            i += 1;
            continue;
        }
        let mut part = Vec::new();
        while i < metas.len() && metas[i].max_time <= t0 + range {
            part.push(metas[i]);
            i += 1;
        }
        parts.push(part);
    }
    parts
}

/// Split a window part wherever a block does not start where the previous
/// one ended.
fn split_at_gaps<'a>(part: Vec<&'a Meta>) -> Vec<Vec<&'a Meta>> {
    let mut runs = Vec::new();
    let mut run: Vec<&'a Meta> = Vec::new();
    for meta in part {
        if run.last().is_some_and(|prev| prev.max_time != meta.min_time) {
            runs.push(std::mem::take(&mut run));
        }
        run.push(meta);
    }
    if !run.is_empty() {
        runs.push(run);
    }
    runs
}

fn select_window<'a>(ranges: &[i64], metas: &[&'a Meta]) -> Vec<&'a Meta> {
    for &range in ranges.iter().skip(1) {
        if let Some(run) = split_by_range(metas, range)
            .into_iter()
            .flat_map(split_at_gaps)
            .find(|run| run.len() > 1)
        {
            return run;
        }
    }
    Vec::new()
}
