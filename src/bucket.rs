//! Object storage capability set used by every stage.
//!
//! Paths are plain `/`-separated strings relative to the bucket root. Block
//! directories live at the root as `<block id>/`.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use futures_util::{future::BoxFuture, TryStreamExt};
use object_store::{path::Path, ObjectStore, PutPayload};
use thiserror::Error;

/// Errors surfaced by a [`Bucket`].
#[derive(Debug, Error)]
pub enum BucketError {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Operation failed in the underlying object store.
    #[error("object store error: {0}")]
    ObjectStore(#[source] object_store::Error),
    /// Operation failed for a transient reason (timeout, reset, throttling).
    #[error("transient bucket error on {path}: {reason}")]
    Transient {
        /// Path the operation targeted.
        path: String,
        /// Human-readable cause.
        reason: String,
    },
}

impl BucketError {
    /// Returns `true` when the object simply did not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` for faults expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            // Network level failures from HTTP backed stores surface as `Generic`.
            Self::ObjectStore(object_store::Error::Generic { .. }) => true,
            _ => false,
        }
    }

    fn from_store(path: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::NotFound(path.to_string()),
            other => Self::ObjectStore(other),
        }
    }
}

/// Minimal object storage interface: list, walk, get, exists, upload, delete.
pub trait Bucket: Send + Sync + fmt::Debug {
    /// List the direct children of `prefix`. Directories end with `/`.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, BucketError>>;

    /// List every object below `prefix`, recursively.
    fn walk<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, BucketError>>;

    /// Read the full content of an object.
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Bytes, BucketError>>;

    /// Check whether an object exists.
    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<bool, BucketError>>;

    /// Write `data` to `path`, replacing any existing object.
    fn upload<'a>(&'a self, path: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), BucketError>>;

    /// Remove an object. Removing a missing object is not an error.
    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), BucketError>>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// [`Bucket`] over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
    name: String,
}

impl ObjectStoreBucket {
    /// Wrap an object store under a display name.
    pub fn new(store: Arc<dyn ObjectStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// In-memory bucket, mostly useful for tests and local experiments.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), name)
    }
}

fn store_path(path: &str) -> Path {
    Path::from(path.trim_matches('/'))
}

fn prefix_path(prefix: &str) -> Option<Path> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(Path::from(trimmed))
    }
}

impl Bucket for ObjectStoreBucket {
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, BucketError>> {
        Box::pin(async move {
            let prefix_path = prefix_path(prefix);
            let listing = self
                .store
                .list_with_delimiter(prefix_path.as_ref())
                .await
                .map_err(|err| BucketError::from_store(prefix, err))?;
            let mut entries =
                Vec::with_capacity(listing.common_prefixes.len() + listing.objects.len());
            entries.extend(listing.common_prefixes.iter().map(|dir| format!("{dir}/")));
            entries.extend(listing.objects.iter().map(|obj| obj.location.to_string()));
            entries.sort();
            Ok(entries)
        })
    }

    fn walk<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, BucketError>> {
        Box::pin(async move {
            let prefix_path = prefix_path(prefix);
            let objects: Vec<_> = self
                .store
                .list(prefix_path.as_ref())
                .try_collect()
                .await
                .map_err(|err| BucketError::from_store(prefix, err))?;
            let mut paths: Vec<String> = objects
                .into_iter()
                .map(|obj| obj.location.to_string())
                .collect();
            paths.sort();
            Ok(paths)
        })
    }

    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Bytes, BucketError>> {
        Box::pin(async move {
            let result = self
                .store
                .get(&store_path(path))
                .await
                .map_err(|err| BucketError::from_store(path, err))?;
            result
                .bytes()
                .await
                .map_err(|err| BucketError::from_store(path, err))
        })
    }

    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<bool, BucketError>> {
        Box::pin(async move {
            match self.store.head(&store_path(path)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(err) => Err(BucketError::from_store(path, err)),
            }
        })
    }

    fn upload<'a>(&'a self, path: &'a str, data: Bytes) -> BoxFuture<'a, Result<(), BucketError>> {
        Box::pin(async move {
            self.store
                .put(&store_path(path), PutPayload::from(data))
                .await
                .map(|_| ())
                .map_err(|err| BucketError::from_store(path, err))
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), BucketError>> {
        Box::pin(async move {
            match self.store.delete(&store_path(path)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(err) => Err(BucketError::from_store(path, err)),
            }
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_separates_directories_and_objects() {
        let bkt = ObjectStoreBucket::in_memory("test");
        bkt.upload("a/meta.json", Bytes::from_static(b"{}"))
            .await
            .expect("upload");
        bkt.upload("a/chunks/000001", Bytes::from_static(b"x"))
            .await
            .expect("upload");
        bkt.upload("b/meta.json", Bytes::from_static(b"{}"))
            .await
            .expect("upload");
        bkt.upload("top", Bytes::from_static(b"t"))
            .await
            .expect("upload");

        let root = bkt.list("").await.expect("list root");
        assert_eq!(root, vec!["a/", "b/", "top"]);

        let block = bkt.list("a/").await.expect("list block");
        assert_eq!(block, vec!["a/chunks/", "a/meta.json"]);

        let all = bkt.walk("a").await.expect("walk");
        assert_eq!(all, vec!["a/chunks/000001", "a/meta.json"]);
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let bkt = ObjectStoreBucket::in_memory("test");
        let err = bkt.get("nope/meta.json").await.expect_err("missing");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert!(!bkt.exists("nope/meta.json").await.expect("exists"));
        bkt.delete("nope/meta.json").await.expect("delete missing");
    }
}
