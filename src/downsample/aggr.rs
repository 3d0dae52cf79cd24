use crate::block::{AggrSample, BlockData};

/// Aggregate every series of `data` into windows of `resolution` ms.
///
/// Windows are aligned to multiples of `resolution`. Each output row is
/// stamped with the last input timestamp of its window. Counter resets
/// (a value lower than its predecessor) are folded into a running offset so
/// the `counter` column stays monotonic across windows.
pub fn downsample(data: &BlockData, resolution: i64) -> BlockData {
    let mut out = BlockData::new();
    if resolution <= 0 {
        return data.clone();
    }
    for (series, samples) in data.iter() {
        let mut current: Option<(i64, AggrSample)> = None;
        let mut prev_counter: Option<f64> = None;
        let mut offset = 0.0;
        for sample in samples {
            if let Some(prev) = prev_counter {
                if sample.counter < prev {
                    offset += prev;
                }
            }
            prev_counter = Some(sample.counter);
            let adjusted = sample.counter + offset;

            let window = sample.t - sample.t.rem_euclid(resolution);
            match current.as_mut() {
                Some((start, acc)) if *start == window => {
                    acc.t = sample.t;
                    acc.count += sample.count;
                    acc.sum += sample.sum;
                    acc.min = acc.min.min(sample.min);
                    acc.max = acc.max.max(sample.max);
                    acc.counter = adjusted;
                }
                _ => {
                    if let Some((_, done)) = current.take() {
                        out.push(series, done);
                    }
                    current = Some((
                        window,
                        AggrSample {
                            counter: adjusted,
                            ..*sample
                        },
                    ));
                }
            }
        }
        if let Some((_, done)) = current {
            out.push(series, done);
        }
    }
    out
}
