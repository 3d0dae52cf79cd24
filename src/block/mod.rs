//! Block layout and the protocols that move blocks in and out of the bucket.
//!
//! A block lives under `<id>/` and consists of data files below `chunks/`,
//! `meta.json`, and optionally `deletion-mark.json`. Uploads write
//! `meta.json` last so a visible meta always implies complete data;
//! deletions remove it first so an interrupted delete degrades to a partial
//! block that abort cleanup finishes later.

pub mod chunks;
/// Deletion mark records.
pub mod deletion_mark;
/// The `meta.json` record.
pub mod meta;

use std::{path::Path, time::SystemTime};

use bytes::Bytes;

pub use self::{
    chunks::{AggrSample, BlockData, ChunkError},
    deletion_mark::DeletionMark,
    meta::{
        BlockDesc, BlockFile, BlockSource, BlockStats, CompactionMeta, Downsample, ExtMeta, Meta,
        MetaError,
    },
};
use crate::{
    bucket::Bucket,
    error::{CompactError, ResultExt},
    id::BlockId,
    observability::log_debug,
};

/// Name of the meta file inside a block directory.
pub const META_FILENAME: &str = "meta.json";
/// Name of the deletion mark inside a block directory.
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";
/// Directory holding data files.
pub const CHUNKS_DIR: &str = "chunks";

pub(crate) fn meta_path(id: &BlockId) -> String {
    format!("{id}/{META_FILENAME}")
}

pub(crate) fn deletion_mark_path(id: &BlockId) -> String {
    format!("{id}/{DELETION_MARK_FILENAME}")
}

/// Write `data` as a block directory at `dir`, filling `meta`'s stats and file list.
pub async fn write_local(dir: &Path, meta: &mut Meta, data: &BlockData) -> Result<(), CompactError> {
    tokio::fs::create_dir_all(dir.join(CHUNKS_DIR))
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    let encoded = data.encode()?;
    let rel_path = format!("{CHUNKS_DIR}/{:06}", 1);
    tokio::fs::write(dir.join(&rel_path), &encoded)
        .await
        .with_context(|| format!("write {rel_path}"))?;

    meta.stats = BlockStats {
        num_samples: data.num_samples(),
        num_series: data.num_series(),
        num_chunks: data.num_chunks(),
    };
    meta.ext.files = vec![BlockFile {
        rel_path,
        size_bytes: encoded.len() as u64,
    }];
    tokio::fs::write(dir.join(META_FILENAME), meta.to_json()?)
        .await
        .context("write meta")?;
    Ok(())
}

/// Read the meta of a local block directory.
pub async fn read_local_meta(dir: &Path) -> Result<Meta, CompactError> {
    let raw = tokio::fs::read(dir.join(META_FILENAME))
        .await
        .with_context(|| format!("read meta in {}", dir.display()))?;
    let meta: Meta = serde_json::from_slice(&raw).map_err(MetaError::from)?;
    meta.validate()?;
    Ok(meta)
}

/// Read every data file of a local block directory.
pub async fn read_local_data(dir: &Path, meta: &Meta) -> Result<BlockData, CompactError> {
    let mut files = Vec::with_capacity(meta.ext.files.len());
    for file in &meta.ext.files {
        let raw = tokio::fs::read(dir.join(&file.rel_path))
            .await
            .with_context(|| format!("read {} of {}", file.rel_path, meta.ulid))?;
        files.push(Bytes::from(raw));
    }
    Ok(BlockData::decode_all(files)?)
}

/// Upload the block directory at `dir`. Data files go first, the meta last.
pub async fn upload(bkt: &dyn Bucket, dir: &Path) -> Result<Meta, CompactError> {
    let meta = read_local_meta(dir).await?;
    for file in &meta.ext.files {
        let raw = tokio::fs::read(dir.join(&file.rel_path))
            .await
            .with_context(|| format!("read {}", file.rel_path))?;
        let dst = format!("{}/{}", meta.ulid, file.rel_path);
        bkt.upload(&dst, Bytes::from(raw))
            .await
            .retry()
            .with_context(|| format!("upload {dst}"))?;
    }
    bkt.upload(&meta_path(&meta.ulid), Bytes::from(meta.to_json()?))
        .await
        .retry()
        .with_context(|| format!("upload meta of {}", meta.ulid))?;
    log_debug!(
        component = "block",
        event = "block_uploaded",
        block = %meta.ulid,
        files = meta.ext.files.len(),
    );
    Ok(meta)
}

/// Download block `id` into `dir`.
pub async fn download(bkt: &dyn Bucket, id: &BlockId, dir: &Path) -> Result<Meta, CompactError> {
    let meta = read_meta(bkt, id)
        .await
        .retry()
        .with_context(|| format!("download meta of {id}"))?;
    tokio::fs::create_dir_all(dir.join(CHUNKS_DIR))
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    for file in &meta.ext.files {
        let src = format!("{id}/{}", file.rel_path);
        let raw = bkt
            .get(&src)
            .await
            .retry()
            .with_context(|| format!("download {src}"))?;
        tokio::fs::write(dir.join(&file.rel_path), &raw)
            .await
            .with_context(|| format!("write {}", file.rel_path))?;
    }
    tokio::fs::write(dir.join(META_FILENAME), meta.to_json()?)
        .await
        .context("write meta")?;
    Ok(meta)
}

/// Read and validate `<id>/meta.json`.
pub async fn read_meta(bkt: &dyn Bucket, id: &BlockId) -> Result<Meta, MetaError> {
    let raw = bkt.get(&meta_path(id)).await?;
    Meta::from_json(*id, &raw)
}

/// Read `<id>/deletion-mark.json`, if present.
pub async fn read_deletion_mark(
    bkt: &dyn Bucket,
    id: &BlockId,
) -> Result<Option<DeletionMark>, MetaError> {
    match bkt.get(&deletion_mark_path(id)).await {
        Ok(raw) => DeletionMark::from_json(*id, &raw).map(Some),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Write a deletion mark for `id` unless one exists.
///
/// Returns `true` when a new mark was written.
pub async fn mark_for_deletion(
    bkt: &dyn Bucket,
    id: &BlockId,
    now: SystemTime,
) -> Result<bool, CompactError> {
    let path = deletion_mark_path(id);
    if bkt
        .exists(&path)
        .await
        .retry()
        .with_context(|| format!("check deletion mark of {id}"))?
    {
        log_debug!(
            component = "block",
            event = "deletion_mark_exists",
            block = %id,
        );
        return Ok(false);
    }
    let mark = DeletionMark::new(*id, now);
    bkt.upload(&path, Bytes::from(mark.to_json()?))
        .await
        .retry()
        .with_context(|| format!("mark {id} for deletion"))?;
    Ok(true)
}

/// Remove every object of block `id`: the meta first, the deletion mark last.
pub async fn delete(bkt: &dyn Bucket, id: &BlockId) -> Result<(), CompactError> {
    let meta = meta_path(id);
    let mark = deletion_mark_path(id);
    bkt.delete(&meta)
        .await
        .with_context(|| format!("delete {meta}"))?;
    let objects = bkt
        .walk(&format!("{id}/"))
        .await
        .with_context(|| format!("walk {id}"))?;
    for object in objects.iter().filter(|o| **o != meta && **o != mark) {
        bkt.delete(object)
            .await
            .with_context(|| format!("delete {object}"))?;
    }
    bkt.delete(&mark)
        .await
        .with_context(|| format!("delete {mark}"))?;
    Ok(())
}
