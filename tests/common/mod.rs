//! Common test utilities for integration tests.
#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use blockcompact::{
    block::{self, AggrSample, BlockData},
    fetcher::{MetaFetcher, SyncState},
    Bucket, BucketError, Clock, Labels, Meta, ObjectStoreBucket,
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use ulid::Ulid;

pub const HOUR_MS: i64 = 3_600_000;
pub const HOUR: Duration = Duration::from_secs(3600);

/// Install a subscriber honouring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs.iter().copied().collect()
}

/// Ten samples per series over `[min, max)`.
pub fn samples(min: i64, max: i64) -> BlockData {
    let mut data = BlockData::new();
    let step = ((max - min) / 10).max(1);
    for series in [r#"{__name__="up",job="api"}"#, r#"{__name__="up",job="db"}"#] {
        let mut t = min;
        while t < max {
            data.push(series, AggrSample::raw(t, (t - min) as f64));
            t += step;
        }
    }
    data
}

/// Upload a block with generated samples, created at `created`.
pub async fn put_block(
    bkt: &dyn Bucket,
    scratch: &Path,
    created: SystemTime,
    min: i64,
    max: i64,
    labels: Labels,
) -> Meta {
    let meta = Meta::new(Ulid::from_datetime(created), min, max, labels);
    put_meta(bkt, scratch, meta).await
}

/// Upload `meta` with generated samples; stats and files are filled in.
pub async fn put_meta(bkt: &dyn Bucket, scratch: &Path, mut meta: Meta) -> Meta {
    let dir = scratch.join(meta.ulid.to_string());
    let data = samples(meta.min_time, meta.max_time);
    block::write_local(&dir, &mut meta, &data).await.unwrap();
    block::upload(bkt, &dir).await.unwrap()
}

/// Unfiltered view of the bucket.
pub async fn fetch_all(bkt: Arc<dyn Bucket>, clock: Arc<dyn Clock>) -> SyncState {
    MetaFetcher::new(bkt, clock, 4).fetch().await.unwrap()
}

/// Bucket injecting transient errors: uploads of `meta.json` fail while
/// armed, and reads of one chosen path fail until cleared.
#[derive(Debug)]
pub struct FailingBucket {
    inner: Arc<dyn Bucket>,
    fail_meta_uploads: AtomicBool,
    fail_reads_of: Mutex<Option<String>>,
}

impl FailingBucket {
    pub fn new(inner: Arc<dyn Bucket>) -> Self {
        Self {
            inner,
            fail_meta_uploads: AtomicBool::new(false),
            fail_reads_of: Mutex::new(None),
        }
    }

    pub fn fail_reads_of(&self, path: Option<String>) {
        *self.fail_reads_of.lock().unwrap() = path;
    }

    pub fn arm(&self, armed: bool) {
        self.fail_meta_uploads.store(armed, Ordering::SeqCst);
    }
}

impl Bucket for FailingBucket {
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, BucketError>> {
        self.inner.list(prefix)
    }

    fn walk<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, BucketError>> {
        self.inner.walk(prefix)
    }

    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Bytes, BucketError>> {
        if self.fail_reads_of.lock().unwrap().as_deref() == Some(path) {
            return Box::pin(async move {
                Err(BucketError::Transient {
                    path: path.to_string(),
                    reason: "injected read failure".to_string(),
                })
            });
        }
        self.inner.get(path)
    }

    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<bool, BucketError>> {
        self.inner.exists(path)
    }

    fn upload<'a>(&'a self, path: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), BucketError>> {
        if self.fail_meta_uploads.load(Ordering::SeqCst) && path.ends_with(block::META_FILENAME) {
            return Box::pin(async move {
                Err(BucketError::Transient {
                    path: path.to_string(),
                    reason: "injected failure".to_string(),
                })
            });
        }
        self.inner.upload(path, data)
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), BucketError>> {
        self.inner.delete(path)
    }

    fn name(&self) -> &str {
        "failing"
    }
}

pub fn memory_bucket() -> Arc<ObjectStoreBucket> {
    Arc::new(ObjectStoreBucket::in_memory("test"))
}
