//! Test-only helpers for seeding buckets with blocks.

use crate::{
    block::{self, AggrSample, BlockData, Meta},
    bucket::Bucket,
};

/// Ten samples per series spread evenly over `[min_time, max_time)`.
pub(crate) fn sample_data(meta: &Meta) -> BlockData {
    let mut data = BlockData::new();
    let span = meta.max_time - meta.min_time;
    if span <= 0 {
        return data;
    }
    let step = (span / 10).max(1);
    for series in [r#"{__name__="up",instance="a"}"#, r#"{__name__="up",instance="b"}"#] {
        let mut t = meta.min_time;
        let mut value = 0.0;
        while t < meta.max_time {
            data.push(series, AggrSample::raw(t, value));
            value += 1.0;
            t += step;
        }
    }
    data
}

async fn write_and_upload(
    bkt: &dyn Bucket,
    meta: &mut Meta,
    data: &BlockData,
    tweak: impl FnOnce(&mut Meta),
) {
    let tmp = tempfile::TempDir::new().unwrap();
    let dir = tmp.path().join(meta.ulid.to_string());
    block::write_local(&dir, meta, data).await.unwrap();
    tweak(meta);
    tokio::fs::write(dir.join(block::META_FILENAME), meta.to_json().unwrap())
        .await
        .unwrap();
    block::upload(bkt, &dir).await.unwrap();
}

/// Upload `meta` with generated data.
pub(crate) async fn put_block(bkt: &dyn Bucket, meta: &Meta) {
    let mut meta = meta.clone();
    let data = sample_data(&meta);
    write_and_upload(bkt, &mut meta, &data, |_| {}).await;
}

/// Upload `meta` with generated data, letting `tweak` alter the meta after
/// its stats were filled in.
pub(crate) async fn put_block_with(
    bkt: &dyn Bucket,
    meta: &mut Meta,
    tweak: impl FnOnce(&mut Meta),
) {
    let data = sample_data(meta);
    write_and_upload(bkt, meta, &data, tweak).await;
}

/// Upload `meta` without any samples.
pub(crate) async fn put_empty_block(bkt: &dyn Bucket, meta: &mut Meta) {
    write_and_upload(bkt, meta, &BlockData::new(), |_| {}).await;
}
