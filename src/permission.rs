//! Entries remember which DNs were recently allowed to read the
//! object at the source, so that a job whose user was just checked
//! can reuse the cached copy without asking the source again.  The
//! same meta file also records until when the cached copy is valid,
//! and the content file's ctime says when it was cached.
//!
//! Edits to the meta file happen under a short-lived lock of their
//! own, distinct from the entry lock that covers downloads.  Reads
//! take no lock at all: meta files are always replaced atomically.
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use tracing::debug;
use tracing::error;

use crate::benign_error::absent_as_none;
use crate::cache::Cache;
use crate::error::CacheError;
use crate::error::IoResultExt;
use crate::error::Result;
use crate::lock::FileLock;
use crate::lock::LockAttempt;
use crate::lock::RetryPolicy;
use crate::meta::MetaFile;
use crate::meta::MetaState;

pub const META_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

pub const META_LOCK_RETRY: RetryPolicy = RetryPolicy {
    attempts: 30,
    interval: Duration::from_millis(100),
};

/// DN records that expired more than this many hours ago are dropped
/// whenever the meta file is rewritten.
pub const EXPIRED_DN_GRACE_HOURS: i64 = 12;

/// Loads the meta file at `path` for `url`, and passes it to `edit`
/// before writing it back.
fn rewrite_meta(path: &Path, url: &str, edit: impl FnOnce(&mut MetaFile)) -> Result<()> {
    let mut meta = match MetaFile::load(path)? {
        MetaState::Absent => {
            return Err(CacheError::MissingMeta {
                path: path.to_owned(),
            })
        }
        MetaState::Malformed => {
            return Err(CacheError::MalformedMeta {
                path: path.to_owned(),
            })
        }
        MetaState::Present(meta) => meta,
    };

    if meta.url != url {
        error!(%url, existing = %meta.url, path = %path.display(), "hash collision");
        return Err(CacheError::Collision {
            url: url.to_string(),
            existing: meta.url,
        });
    }

    edit(&mut meta);
    meta.store(path)
}

impl Cache {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from(self.host.now())
    }

    /// Applies `edit` to the meta file of `url`, under the meta lock.
    fn edit_meta(&mut self, url: &str, edit: impl FnOnce(&mut MetaFile)) -> Result<()> {
        self.check_usable()?;
        let path = self.bind(url)?.meta_path();
        // No entry, nowhere to put a lock.
        if absent_as_none(std::fs::symlink_metadata(&path))
            .at(&path)?
            .is_none()
        {
            return Err(CacheError::MissingMeta { path });
        }

        let host = Arc::clone(&self.host);
        let lock = FileLock::new(&path, META_LOCK_TIMEOUT, META_LOCK_RETRY, &*host);

        if let LockAttempt::Busy = lock.acquire()? {
            debug!(%url, "meta file is locked");
            return Err(CacheError::Locked {
                url: url.to_string(),
            });
        }

        let result = rewrite_meta(&path, url, edit);
        let released = lock.release();
        result?;
        released
    }

    /// Reads the meta file of `url`, if it belongs to `url`.
    fn read_meta(&mut self, url: &str) -> Result<Option<MetaFile>> {
        self.check_usable()?;
        let path = self.bind(url)?.meta_path();

        Ok(match MetaFile::load(&path)? {
            MetaState::Present(meta) if meta.url == url => Some(meta),
            _ => None,
        })
    }

    /// Records that `dn` may read `url` until `expiry`.  The entry
    /// must exist, i.e., `start` must have succeeded for `url`.
    pub fn add_dn(&mut self, url: &str, dn: &str, expiry: DateTime<Utc>) -> Result<()> {
        let now = self.now();
        let grace = chrono::Duration::hours(EXPIRED_DN_GRACE_HOURS);

        self.edit_meta(url, |meta| meta.grant(dn, expiry, now, grace))?;
        debug!(%url, %dn, %expiry, "added DN");
        Ok(())
    }

    /// Returns whether `dn` currently may read `url`.
    pub fn check_dn(&mut self, url: &str, dn: &str) -> Result<bool> {
        let now = self.now();
        Ok(self
            .read_meta(url)?
            .map_or(false, |meta| meta.permits(dn, now)))
    }

    /// Records that the cached copy of `url` is valid until `when`.
    pub fn set_valid(&mut self, url: &str, when: DateTime<Utc>) -> Result<()> {
        self.edit_meta(url, |meta| meta.validity = Some(when))
    }

    /// Returns until when the cached copy of `url` is valid, if known.
    pub fn valid_until(&mut self, url: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_meta(url)?.and_then(|meta| meta.validity))
    }

    /// Returns whether a validity time is known for `url`.
    pub fn check_valid(&mut self, url: &str) -> Result<bool> {
        Ok(self.valid_until(url)?.is_some())
    }

    /// Returns when the content for `url` was cached: the content
    /// file's ctime, or `None` if there is no content.
    pub fn created(&mut self, url: &str) -> Result<Option<DateTime<Utc>>> {
        self.check_usable()?;
        let content = self.bind(url)?.content;

        Ok(absent_as_none(std::fs::metadata(&content))
            .at(&content)?
            .and_then(|meta| {
                Utc.timestamp_opt(meta.ctime(), meta.ctime_nsec() as u32)
                    .single()
            }))
    }

    /// Returns whether a creation time is available for `url`.
    pub fn check_created(&mut self, url: &str) -> Result<bool> {
        Ok(self.created(url)?.is_some())
    }
}
