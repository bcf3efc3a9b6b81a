//! Populating a cache entry: `start` decides whether the caller
//! should download the object, and `stop` or `stop_and_delete`
//! publish or abandon the download.
//!
//! Only the holder of an entry's lock may write its content file.
//! The meta file's first line guards against hash collisions: an
//! entry always belongs to the first URL that created it.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::benign_error::absent_as_none;
use crate::benign_error::ensure_file_removed;
use crate::cache::Binding;
use crate::cache::Cache;
use crate::cache_dir::ensure_dir;
use crate::error::CacheError;
use crate::error::IoResultExt;
use crate::error::Result;
use crate::lock::FileLock;
use crate::lock::Host;
use crate::lock::LockAttempt;
use crate::lock::RetryPolicy;
use crate::meta::MetaFile;
use crate::meta::MetaState;

/// Entry locks older than this belong to a crashed or hung writer.
pub const ENTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub const ENTRY_LOCK_RETRY: RetryPolicy = RetryPolicy {
    attempts: 2,
    interval: Duration::from_millis(100),
};

/// What the caller of [`Cache::start`] should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// The object is cached; go ahead and `link` it.
    Available,
    /// We hold the entry lock.  Download to [`Cache::file`], then
    /// `link` and `stop`, or `stop_and_delete` on failure.
    Populate,
    /// Someone else is downloading the object.  Try again later, or
    /// download it without the cache.
    Locked,
}

impl StartOutcome {
    pub fn available(self) -> bool {
        self == StartOutcome::Available
    }

    pub fn is_locked(self) -> bool {
        self == StartOutcome::Locked
    }
}

pub(crate) fn entry_lock<'a>(content: &Path, host: &'a dyn Host) -> FileLock<'a> {
    FileLock::new(content, ENTRY_LOCK_TIMEOUT, ENTRY_LOCK_RETRY, host)
}

pub(crate) fn content_exists(content: &Path) -> Result<bool> {
    Ok(absent_as_none(std::fs::symlink_metadata(content))
        .at(content)?
        .is_some())
}

/// Makes sure the meta file at `path` names `url`, creating it if
/// needed.
fn claim_meta(path: &Path, url: &str) -> Result<()> {
    match MetaFile::load(path)? {
        MetaState::Present(meta) if meta.url == url => Ok(()),
        MetaState::Present(meta) => {
            error!(%url, existing = %meta.url, path = %path.display(), "hash collision");
            Err(CacheError::Collision {
                url: url.to_string(),
                existing: meta.url,
            })
        }
        MetaState::Absent => MetaFile::new(url).store(path),
        MetaState::Malformed => {
            warn!(path = %path.display(), "replacing malformed meta file");
            MetaFile::new(url).store(path)
        }
    }
}

/// Returns whether the entry at `binding` holds content for `url`.
/// Content without a valid meta file does not count.  Fails if the
/// entry belongs to another URL.
fn entry_available(binding: &Binding, url: &str) -> Result<bool> {
    if !content_exists(&binding.content)? {
        return Ok(false);
    }

    let path = binding.meta_path();
    match MetaFile::load(&path)? {
        MetaState::Present(meta) if meta.url == url => Ok(true),
        MetaState::Present(meta) => {
            error!(%url, existing = %meta.url, path = %path.display(), "hash collision");
            Err(CacheError::Collision {
                url: url.to_string(),
                existing: meta.url,
            })
        }
        MetaState::Absent | MetaState::Malformed => {
            debug!(%url, path = %path.display(), "content has no valid meta file");
            Ok(false)
        }
    }
}

impl Cache {
    /// Binds `url` to a writable cache and creates its directory.
    /// Writable caches where that fails are dropped, and we try the
    /// next.
    fn prepare(&mut self, url: &str) -> Result<Binding> {
        loop {
            let binding = self.bind_writable(url)?;
            let dir = match binding.content.parent() {
                Some(dir) => dir,
                None => return Ok(binding),
            };

            match ensure_dir(dir, 0o700) {
                Ok(()) => return Ok(binding),
                Err(e) => {
                    warn!(path = %dir.display(), %e, "failed to create cache directory");
                    self.drop_writable(&binding.cache);
                }
            }
        }
    }

    /// Looks for complete content for `url` in a read-only cache,
    /// without taking any lock there.
    fn readonly_available(&mut self, url: &str) -> Result<bool> {
        let binding = self.bind(url)?;
        if self.is_writable(&binding.cache) {
            return Ok(false);
        }

        let host = Arc::clone(&self.host);
        if entry_lock(&binding.content, &*host).exists()? {
            debug!(%url, "read-only entry is being written");
            return Ok(false);
        }

        entry_available(&binding, url)
    }

    /// Prepares the entry for `url`.  If `delete_first`, any cached
    /// content is discarded and the caller gets to download it again.
    ///
    /// On [`StartOutcome::Populate`], this process holds the entry
    /// lock and must eventually call [`Cache::stop`] or
    /// [`Cache::stop_and_delete`] (or hand the lock to
    /// [`Cache::link`]).  New content always goes to a writable cache,
    /// even if a read-only cache has (or had) a copy.
    ///
    /// Fails with [`CacheError::Collision`] if the entry belongs to a
    /// different URL; the object must not be cached.
    pub fn start(&mut self, url: &str, delete_first: bool) -> Result<StartOutcome> {
        if !delete_first && self.readonly_available(url)? {
            debug!(%url, "entry is available in a read-only cache");
            return Ok(StartOutcome::Available);
        }

        let binding = self.prepare(url)?;
        let host = Arc::clone(&self.host);
        let lock = entry_lock(&binding.content, &*host);

        let mut held = false;
        let mut stale = false;
        if lock.exists()? {
            match lock.acquire()? {
                LockAttempt::Busy => {
                    debug!(%url, "entry is locked");
                    return Ok(StartOutcome::Locked);
                }
                LockAttempt::Acquired { stale_removed } => {
                    held = true;
                    stale = stale_removed;
                }
            }
        }

        if !delete_first && !stale {
            match entry_available(&binding, url) {
                Ok(false) => {}
                Ok(true) => {
                    if held {
                        lock.release()?;
                    }

                    debug!(%url, "entry is available");
                    return Ok(StartOutcome::Available);
                }
                Err(e) => {
                    if held {
                        if let Err(release_error) = lock.release() {
                            warn!(%url, e = %release_error, "failed to release entry lock");
                        }
                    }

                    return Err(e);
                }
            }
        }

        if !held {
            match lock.acquire()? {
                LockAttempt::Busy => {
                    debug!(%url, "entry is locked");
                    return Ok(StartOutcome::Locked);
                }
                LockAttempt::Acquired { stale_removed } => stale |= stale_removed,
            }
        }
        self.released.remove(url);

        let populate = claim_meta(&binding.meta_path(), url).and_then(|()| {
            // Leftover content is never reused.
            if delete_first || stale || content_exists(&binding.content)? {
                info!(%url, path = %binding.content.display(), "discarding cached content");
                ensure_file_removed(&binding.content).at(&binding.content)?;
            }

            Ok(StartOutcome::Populate)
        });

        if populate.is_err() {
            if let Err(e) = lock.release() {
                warn!(%url, %e, "failed to release entry lock");
            }
        }

        populate
    }

    /// Releases the entry lock for `url`, once the content file is
    /// complete.  Succeeds without touching anything if `link`
    /// already released the lock.
    ///
    /// Fails, and leaves the lock alone, if this process does not
    /// hold the lock.
    pub fn stop(&mut self, url: &str) -> Result<()> {
        self.check_usable()?;
        if self.released.remove(url) {
            debug!(%url, "lock already released by link");
            return Ok(());
        }

        let binding = self.bind(url)?;
        let host = Arc::clone(&self.host);
        entry_lock(&binding.content, &*host).release()
    }

    /// Deletes the entry for `url`, then releases its lock.  Use this
    /// when a download failed.
    pub fn stop_and_delete(&mut self, url: &str) -> Result<()> {
        self.check_usable()?;
        let binding = self.bind(url)?;
        let host = Arc::clone(&self.host);
        let lock = entry_lock(&binding.content, &*host);

        lock.ensure_owned()?;

        let meta = binding.meta_path();
        if let Err(e) = ensure_file_removed(&meta) {
            warn!(path = %meta.display(), %e, "failed to remove meta file");
        }

        // The lock goes last: nobody may see an unlocked, partial entry.
        ensure_file_removed(&binding.content).at(&binding.content)?;
        lock.force_release()?;
        info!(%url, "deleted cache entry");
        Ok(())
    }
}
