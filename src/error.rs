//! Every fallible cache operation reports a [`CacheError`].  Most
//! variants are permanent for the object at hand; [`CacheError::TryAgain`]
//! and [`CacheError::Locked`] only mean another process got there
//! first, and the caller should come back later.
use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockOwner;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// No writable cache directory is (or remains) available.  The
    /// `Cache` is unusable from now on.
    #[error("no usable writable cache directory")]
    NoWritableCache,

    #[error("invalid cache layout: {levels} levels of {length} characters")]
    InvalidLayout { levels: usize, length: usize },

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// Two URLs share the same hash.  The second one is never cached.
    #[error("{url} hashes to an entry already owned by {existing}")]
    Collision { url: String, existing: String },

    /// Another process holds the lock for this entry.
    #[error("cache entry for {url} is locked")]
    Locked { url: String },

    /// The entry changed under our feet; restart from `Cache::start`.
    #[error("cache entry for {url} changed while linking, try again")]
    TryAgain { url: String },

    #[error("no lock held on {}", .path.display())]
    LockNotHeld { path: PathBuf },

    #[error("lock on {} is owned by {owner}", .path.display())]
    LockOwnedByOther { path: PathBuf, owner: LockOwner },

    #[error("lock file {} is malformed", .path.display())]
    MalformedLock { path: PathBuf },

    #[error("meta file {} is malformed", .path.display())]
    MalformedMeta { path: PathBuf },

    #[error("meta file {} is missing", .path.display())]
    MissingMeta { path: PathBuf },

    #[error("cannot cache an empty URL")]
    EmptyUrl,

    #[error("invalid link destination {}", .0.display())]
    InvalidDestination(PathBuf),

    #[error("invalid expiry time {0:?}")]
    InvalidExpiry(String),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// Wraps an I/O error with the path that caused it.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns whether the failure is transient contention, rather
    /// than a permanent problem with the cache or the entry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::TryAgain { .. } | CacheError::Locked { .. })
    }
}

/// Attaches a path to `std::io::Result`s.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    #[inline]
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| CacheError::io(path, e))
    }
}

#[test]
fn test_retryable() {
    assert!(CacheError::TryAgain { url: "a".into() }.is_retryable());
    assert!(CacheError::Locked { url: "a".into() }.is_retryable());
    assert!(!CacheError::NoWritableCache.is_retryable());
    assert!(!CacheError::Collision {
        url: "a".into(),
        existing: "b".into()
    }
    .is_retryable());
}
