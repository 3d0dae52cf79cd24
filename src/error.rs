//! Error taxonomy shared by every stage.
//!
//! Each [`CompactError`] carries an [`ErrorKind`] that decides how the run
//! loop reacts: halt, retry on the next interval, or exit. Wrapping an error
//! with [`CompactError::context`] never changes its kind.

use std::fmt;

use thiserror::Error;

use crate::{
    block::{chunks::ChunkError, MetaError},
    bucket::BucketError,
    id::BlockId,
    option::OptionError,
    relabel::RelabelError,
};

/// How the run loop treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structural problem or data corruption; needs a human.
    Halt,
    /// Transient infrastructure fault; the next iteration may succeed.
    Retry,
    /// Anything else. Treated as fatal.
    Unclassified,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Halt => f.write_str("halt"),
            ErrorKind::Retry => f.write_str("retry"),
            ErrorKind::Unclassified => f.write_str("unclassified"),
        }
    }
}

/// Root causes wrapped by [`CompactError`].
#[derive(Debug, Error)]
pub enum ErrorCause {
    /// Object storage failure.
    #[error(transparent)]
    Bucket(#[from] BucketError),
    /// Meta or deletion-mark record could not be read or written.
    #[error(transparent)]
    Meta(#[from] MetaError),
    /// Block data could not be encoded or decoded.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// Local filesystem failure in a working directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid configuration.
    #[error(transparent)]
    Option(#[from] OptionError),
    /// Invalid relabel configuration.
    #[error(transparent)]
    Relabel(#[from] RelabelError),
    /// Blocks in one group overlap and vertical compaction is off.
    #[error("overlapping blocks in group {group}: {blocks:?}")]
    Overlap {
        /// Group key.
        group: String,
        /// Overlapping block ids.
        blocks: Vec<BlockId>,
    },
    /// An input block failed verification.
    #[error("block {id} is not healthy: {reason}")]
    UnhealthyBlock {
        /// Offending block.
        id: BlockId,
        /// What the verification found.
        reason: String,
    },
    /// Internal invariant broken.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Error returned by every stage, tagged with an [`ErrorKind`].
#[derive(Debug)]
pub struct CompactError {
    kind: ErrorKind,
    context: Vec<String>,
    cause: ErrorCause,
}

impl CompactError {
    fn with_kind(kind: ErrorKind, cause: impl Into<ErrorCause>) -> Self {
        Self {
            kind,
            context: Vec::new(),
            cause: cause.into(),
        }
    }

    /// Halt-class error.
    pub fn halt(cause: impl Into<ErrorCause>) -> Self {
        Self::with_kind(ErrorKind::Halt, cause)
    }

    /// Retry-class error.
    pub fn retry(cause: impl Into<ErrorCause>) -> Self {
        Self::with_kind(ErrorKind::Retry, cause)
    }

    /// Unclassified error.
    pub fn unclassified(cause: impl Into<ErrorCause>) -> Self {
        Self::with_kind(ErrorKind::Unclassified, cause)
    }

    /// Internal invariant violation, halt-class.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::halt(ErrorCause::Invariant(msg.into()))
    }

    /// Wrap with a context message; the kind is preserved.
    pub fn context(mut self, msg: impl Into<String>) -> Self {
        self.context.push(msg.into());
        self
    }

    /// Promote to halt-class.
    pub fn into_halt(mut self) -> Self {
        self.kind = ErrorKind::Halt;
        self
    }

    /// Promote to retry-class. Halt-class errors stay halt-class.
    pub fn into_retry(mut self) -> Self {
        if self.kind != ErrorKind::Halt {
            self.kind = ErrorKind::Retry;
        }
        self
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Root cause.
    pub fn cause(&self) -> &ErrorCause {
        &self.cause
    }

    /// Returns `true` for halt-class errors.
    pub fn is_halt(&self) -> bool {
        self.kind == ErrorKind::Halt
    }

    /// Returns `true` for retry-class errors.
    pub fn is_retry(&self) -> bool {
        self.kind == ErrorKind::Retry
    }
}

impl fmt::Display for CompactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for msg in self.context.iter().rev() {
            write!(f, "{msg}: ")?;
        }
        write!(f, "{}", self.cause)
    }
}

impl std::error::Error for CompactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

impl From<BucketError> for CompactError {
    fn from(err: BucketError) -> Self {
        if err.is_transient() {
            Self::retry(err)
        } else {
            Self::unclassified(err)
        }
    }
}

impl From<MetaError> for CompactError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::Bucket(bucket) => bucket.into(),
            other => Self::unclassified(other),
        }
    }
}

impl From<ChunkError> for CompactError {
    fn from(err: ChunkError) -> Self {
        Self::unclassified(err)
    }
}

impl From<std::io::Error> for CompactError {
    fn from(err: std::io::Error) -> Self {
        Self::unclassified(err)
    }
}

impl From<OptionError> for CompactError {
    fn from(err: OptionError) -> Self {
        Self::unclassified(err)
    }
}

impl From<RelabelError> for CompactError {
    fn from(err: RelabelError) -> Self {
        Self::unclassified(err)
    }
}

/// Context helpers for results carrying a [`CompactError`] or a convertible error.
pub trait ResultExt<T> {
    /// Wrap the error with a context message, keeping its kind.
    fn context(self, msg: impl Into<String>) -> Result<T, CompactError>;

    /// Wrap lazily; the closure only runs on error.
    fn with_context<F, S>(self, f: F) -> Result<T, CompactError>
    where
        F: FnOnce() -> S,
        S: Into<String>;

    /// Reclassify the error as retry-class (halt-class errors stay halt-class).
    fn retry(self) -> Result<T, CompactError>;

    /// Reclassify the error as halt-class.
    fn halt(self) -> Result<T, CompactError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<CompactError>,
{
    fn context(self, msg: impl Into<String>) -> Result<T, CompactError> {
        self.map_err(|err| err.into().context(msg))
    }

    fn with_context<F, S>(self, f: F) -> Result<T, CompactError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }

    fn retry(self) -> Result<T, CompactError> {
        self.map_err(|err| err.into().into_retry())
    }

    fn halt(self) -> Result<T, CompactError> {
        self.map_err(|err| err.into().into_halt())
    }
}

/// Pick the error to surface from several concurrent failures: halt beats
/// unclassified beats retry, so a halt cause is never hidden.
pub(crate) fn most_severe(errors: Vec<CompactError>) -> Option<CompactError> {
    fn rank(kind: ErrorKind) -> u8 {
        match kind {
            ErrorKind::Halt => 2,
            ErrorKind::Unclassified => 1,
            ErrorKind::Retry => 0,
        }
    }
    let mut best: Option<CompactError> = None;
    for err in errors {
        best = match best {
            Some(current) if rank(current.kind) >= rank(err.kind) => Some(current),
            _ => Some(err),
        };
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind_and_renders_chain() {
        let err = CompactError::invariant("two heads")
            .context("group 0@1")
            .context("compaction");
        assert!(err.is_halt());
        assert_eq!(
            err.to_string(),
            "compaction: group 0@1: invariant violated: two heads"
        );
    }

    #[test]
    fn retry_never_downgrades_halt() {
        let res: Result<(), CompactError> = Err(CompactError::invariant("x"));
        let err = res.retry().context("upload").expect_err("err");
        assert!(err.is_halt());
    }

    #[test]
    fn transient_bucket_errors_are_retry_class() {
        let err: CompactError = BucketError::Transient {
            path: "a".into(),
            reason: "connection reset".into(),
        }
        .into();
        assert!(err.is_retry());
        let err: CompactError = BucketError::NotFound("a".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unclassified);
    }

    #[test]
    fn most_severe_prefers_halt() {
        let picked = most_severe(vec![
            CompactError::retry(ErrorCause::Invariant("r".into())),
            CompactError::invariant("h"),
            CompactError::unclassified(ErrorCause::Invariant("u".into())),
        ])
        .expect("some");
        assert!(picked.is_halt());
        assert!(most_severe(Vec::new()).is_none());
    }
}
