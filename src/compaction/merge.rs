use std::fmt;

use crate::block::BlockData;

/// Combines the data of a compaction plan into one output.
pub trait BlockMerger: Send + Sync + fmt::Debug {
    /// Merge `inputs` in plan order.
    fn merge(&self, inputs: Vec<BlockData>) -> BlockData;
}

/// Concatenates every series across inputs and orders rows by timestamp.
///
/// Samples of overlapping replicas are kept side by side without
/// deduplication, so vertical compaction is only correct for replicas
/// carrying identical samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatMerger;

impl BlockMerger for ConcatMerger {
    fn merge(&self, inputs: Vec<BlockData>) -> BlockData {
        let mut out = BlockData::new();
        for input in inputs {
            out.merge(input);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::AggrSample;

    #[test]
    fn replicas_are_concatenated() {
        let mut r1 = BlockData::new();
        r1.push("s", AggrSample::raw(0, 1.0));
        r1.push("s", AggrSample::raw(10, 2.0));
        let mut r2 = BlockData::new();
        r2.push("s", AggrSample::raw(0, 1.0));
        r2.push("s", AggrSample::raw(10, 2.0));
        r2.push("only_r2", AggrSample::raw(5, 3.0));

        let merged = ConcatMerger.merge(vec![r1, r2]);
        assert_eq!(merged.num_samples(), 5);
        assert_eq!(merged.num_series(), 2);
        let ts: Vec<i64> = merged.samples("s").unwrap().iter().map(|s| s.t).collect();
        assert_eq!(ts, vec![0, 0, 10, 10]);
    }
}
