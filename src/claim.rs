//! Jobs never use cache content files directly.  `link` first hard
//! links the content file into a per-job directory: as long as that
//! link exists, the data stay on disk, whatever happens to the entry.
//! The job then sees a symlink to (or a copy of) the hard link.
//!
//! `link` does not hold the entry lock while it works.  Instead, it
//! checks after the fact that no writer touched the entry since it
//! looked, and backs out if one did.
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use filetime::FileTime;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::benign_error::absent_as_none;
use crate::benign_error::ensure_file_removed;
use crate::benign_error::is_absent_file_error;
use crate::cache::Binding;
use crate::cache::Cache;
use crate::cache_dir::ensure_dir;
use crate::entry::content_exists;
use crate::entry::entry_lock;
use crate::error::CacheError;
use crate::error::IoResultExt;
use crate::error::Result;
use crate::lock::FileLock;

/// How [`Cache::link`] should materialise the file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Copy the file to the destination instead of symlinking it.
    pub copy: bool,
    /// Copy the file, and make the copy executable.
    pub executable: bool,
    /// The caller holds the entry lock (after `start` returned
    /// `Populate`).  `link` releases it.
    pub holding_lock: bool,
}

impl LinkOptions {
    pub fn copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    pub fn holding_lock(mut self, holding_lock: bool) -> Self {
        self.holding_lock = holding_lock;
        self
    }
}

fn modification_time(path: &Path) -> Result<Option<FileTime>> {
    Ok(absent_as_none(std::fs::metadata(path))
        .at(path)?
        .map(|meta| FileTime::from_last_modification_time(&meta)))
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Returns whether the entry looks exactly as it did when we took
/// `snapshot` of its mtime: unlocked, present, and unmodified.
fn unchanged(content: &Path, lock: &FileLock, snapshot: FileTime) -> Result<bool> {
    if lock.exists()? {
        debug!(path = %content.display(), "entry was locked while linking");
        return Ok(false);
    }

    match modification_time(content)? {
        None => {
            debug!(path = %content.display(), "entry vanished while linking");
            Ok(false)
        }
        Some(mtime) if mtime > snapshot => {
            debug!(path = %content.display(), "entry was modified while linking");
            Ok(false)
        }
        Some(_) => Ok(true),
    }
}

fn remove_hard_link(hard_link: &Path) {
    if let Err(e) = ensure_file_removed(hard_link) {
        warn!(path = %hard_link.display(), %e, "failed to remove job link");
    }
}

impl Cache {
    fn chown(&self, path: &Path) -> Result<()> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid)).at(path)
    }

    /// Creates `dir` if it is missing, owned by the job's user.
    fn ensure_job_owned_dir(&self, dir: &Path) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }

        ensure_dir(dir, 0o700).at(dir)?;
        self.chown(dir)
    }

    /// Copies `source` to a new file at `dest`, owned by the job.
    fn copy_out(&self, source: &Path, dest: &Path, executable: bool) -> Result<()> {
        let mode = if executable { 0o700 } else { 0o600 };
        let mut input = std::fs::File::open(source).at(source)?;
        let mut output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(dest)
            .at(dest)?;

        std::io::copy(&mut input, &mut output).at(dest)?;
        output
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .at(dest)?;
        self.chown(dest)
    }

    /// Points a symlink at `dest` to `target`, replacing any symlink
    /// that is already there.
    fn symlink_out(&self, target: &Path, dest: &Path) -> Result<()> {
        if let Some(existing) = absent_as_none(std::fs::symlink_metadata(dest)).at(dest)? {
            if existing.file_type().is_symlink() {
                ensure_file_removed(dest).at(dest)?;
            }
        }

        std::os::unix::fs::symlink(target, dest).at(dest)?;
        std::os::unix::fs::lchown(dest, Some(self.uid), Some(self.gid)).at(dest)
    }

    /// Hard links the entry's content into the job's directory, and
    /// returns the link's path.
    fn hard_link(&self, binding: &Binding, name: &OsStr, url: &str) -> Result<PathBuf> {
        let job_dir = binding.cache.job_dir(&self.job_id);
        self.ensure_job_owned_dir(&job_dir)?;

        let hard_link = job_dir.join(name);
        ensure_file_removed(&hard_link).at(&hard_link)?;
        match std::fs::hard_link(&binding.content, &hard_link) {
            Ok(()) => Ok(hard_link),
            Err(e) if is_absent_file_error(&e) => {
                debug!(%url, "content vanished before linking");
                Err(CacheError::TryAgain {
                    url: url.to_string(),
                })
            }
            Err(e) => Err(CacheError::io(&hard_link, e)),
        }
    }

    /// Gives the job a reference to the cached copy of `url` at
    /// `dest`.  The entry must have content, i.e., `start` returned
    /// `Available`, or `Populate` and the download is complete.
    ///
    /// Fails with [`CacheError::TryAgain`], having undone its work, if
    /// the entry has no content or changed while we were linking; the
    /// caller should start over with [`Cache::start`].
    ///
    /// With `options.holding_lock`, the entry lock is released once the
    /// job's hard link exists, and the next [`Cache::stop`] for `url`
    /// is a no-op.
    pub fn link(&mut self, dest: impl AsRef<Path>, url: &str, options: LinkOptions) -> Result<()> {
        self.check_usable()?;
        let dest = dest.as_ref();
        let name = dest
            .file_name()
            .ok_or_else(|| CacheError::InvalidDestination(dest.to_owned()))?;
        let binding = self.bind(url)?;
        let host = Arc::clone(&self.host);
        let lock = entry_lock(&binding.content, &*host);
        let try_again = || CacheError::TryAgain {
            url: url.to_string(),
        };

        let snapshot = match modification_time(&binding.content)? {
            Some(mtime) => mtime,
            None => {
                debug!(%url, "no content to link");
                return Err(try_again());
            }
        };

        // A writer that locks, rewrites and unlocks within this same
        // second would be invisible to the mtime check.
        if !options.holding_lock && snapshot.unix_seconds() == unix_seconds(host.now()) {
            host.sleep(Duration::from_secs(1));
        }

        let hard_link = self.hard_link(&binding, name, url)?;

        if options.holding_lock {
            if let Err(e) = lock.release() {
                remove_hard_link(&hard_link);
                return Err(e);
            }

            self.released.insert(url.to_string());
        } else {
            match unchanged(&binding.content, &lock, snapshot) {
                Ok(true) => {}
                Ok(false) => {
                    remove_hard_link(&hard_link);
                    return Err(try_again());
                }
                Err(e) => {
                    remove_hard_link(&hard_link);
                    return Err(e);
                }
            }
        }

        if let Some(parent) = dest.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            self.ensure_job_owned_dir(parent)?;
        }

        if options.copy || options.executable || binding.cache.forces_copy() {
            self.copy_out(&hard_link, dest, options.executable)?;
            info!(%url, dest = %dest.display(), "copied cached file");
        } else {
            let target = binding.cache.link_target(&hard_link);
            self.symlink_out(&target, dest)?;
            info!(%url, dest = %dest.display(), target = %target.display(), "linked cached file");
        }

        Ok(())
    }

    /// Removes every link this job holds, in every configured cache,
    /// including writable caches we gave up on.  Safe to call more
    /// than once.  Keeps going past failures, and reports the first.
    pub fn release(&self) -> Result<()> {
        self.check_configured()?;

        let mut first_error = None;
        for dir in self.job_dirs() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(path = %dir.display(), "released job links"),
                Err(e) if is_absent_file_error(&e) => {}
                Err(e) => {
                    warn!(path = %dir.display(), %e, "failed to release job links");
                    first_error.get_or_insert(CacheError::io(&dir, e));
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Returns whether the entry for `url` currently has content.
    pub fn has_content(&mut self, url: &str) -> Result<bool> {
        let binding = self.bind(url)?;
        content_exists(&binding.content)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::testing::*;
    use crate::entry::StartOutcome;
    use crate::lock::testing::FakeHost;
    use filetime::set_file_mtime;
    use test_dir::{DirBuilder, TestDir};

    const URL: &str = "http://host.org/file1";
    const OTHER_URL: &str = "http://host.org/file2";
    const SUFFIX: &str = "8a/929b8384300813ba1dd2d661c42835b80691a2";
    const OTHER_DIR: &str = "47";

    /// Where `cache_at` stops the clock, in seconds since the epoch.
    const FROZEN: i64 = 1_000_000_000;

    /// Returns a cache over `temp/cache` whose clock stands at
    /// `FROZEN`, and whose first sleep runs `hook`.
    fn cache_at(temp: &TestDir, hook: impl FnOnce() + Send + 'static) -> Cache {
        let now = UNIX_EPOCH + Duration::from_millis(FROZEN as u64 * 1000 + 500);
        Cache::builder()
            .writer(temp.path("cache").to_string_lossy())
            .job("job1", unsafe { libc::getuid() }, unsafe { libc::getgid() })
            .host(Arc::new(FakeHost::new(PID, HOST, &[]).at(now).on_sleep(hook)))
            .build()
    }

    /// Populates `url` in `cache`, and leaves the lock held.
    fn populate(cache: &mut Cache, url: &str, data: &str) -> PathBuf {
        assert_eq!(
            cache.start(url, false).expect("start should succeed"),
            StartOutcome::Populate
        );
        let path = cache.file(url).expect("file should succeed");
        std::fs::write(&path, data).expect("write should succeed");
        path
    }

    /// Moves `path`'s mtime to the past, so `link` need not sleep.
    fn age(path: &Path) {
        set_file_mtime(path, FileTime::from_unix_time(1_000_000_000, 0))
            .expect("set_file_mtime should succeed");
    }

    #[test]
    fn test_link_missing_content() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);

        assert!(matches!(
            cache.link(temp.path("session/file1"), URL, LinkOptions::default()),
            Err(CacheError::TryAgain { .. })
        ));
        assert!(!temp.path("cache/joblinks").exists());
        assert!(!temp.path("session").exists());
        assert!(!cache.has_content(URL).expect("should succeed"));
    }

    #[test]
    fn test_link_holding_lock() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);
        let path = populate(&mut cache, URL, "data");
        let dest = temp.path("session/file1");

        cache
            .link(&dest, URL, LinkOptions::default().holding_lock(true))
            .expect("link should succeed");
        assert!(!temp.path(&format!("cache/data/{}.lock", SUFFIX)).exists());
        assert_eq!(std::fs::read_to_string(&dest).expect("should read"), "data");
        assert_eq!(
            std::fs::read_link(&dest).expect("dest is a symlink"),
            temp.path("cache/joblinks/job1/file1")
        );

        // The hand-off makes the next stop a no-op, once.
        cache.stop(URL).expect("stop should succeed");
        assert!(matches!(
            cache.stop(URL),
            Err(CacheError::LockNotHeld { .. })
        ));
        assert!(path.exists());
    }

    #[test]
    fn test_link_available() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);
        let path = populate(&mut cache, URL, "data");
        cache.stop(URL).expect("stop should succeed");
        age(&path);

        assert_eq!(
            cache.start(URL, false).expect("start should succeed"),
            StartOutcome::Available
        );
        cache
            .link(temp.path("session/file1"), URL, LinkOptions::default())
            .expect("link should succeed");
        assert_eq!(
            std::fs::read_to_string(temp.path("session/file1")).expect("should read"),
            "data"
        );

        // Re-linking replaces both the hard link and the symlink.
        cache
            .link(temp.path("session/file1"), URL, LinkOptions::default())
            .expect("link should succeed");
    }

    #[test]
    fn test_link_survives_delete() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);
        let path = populate(&mut cache, URL, "data");
        let dest = temp.path("session/file1");

        cache
            .link(&dest, URL, LinkOptions::default().holding_lock(true))
            .expect("link should succeed");

        // Another job evicts and re-populates the entry.
        assert_eq!(
            cache.start(URL, true).expect("start should succeed"),
            StartOutcome::Populate
        );
        assert!(!path.exists());
        std::fs::write(&path, "new data").expect("write should succeed");
        cache.stop(URL).expect("stop should succeed");

        assert_eq!(std::fs::read_to_string(&dest).expect("should read"), "data");
    }

    #[test]
    fn test_link_while_locked() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);
        let path = populate(&mut cache, URL, "data");
        age(&path);

        // We do not hold the lock as far as `link` knows, so the lock
        // file means someone is rewriting the entry.
        assert!(matches!(
            cache.link(temp.path("session/file1"), URL, LinkOptions::default()),
            Err(CacheError::TryAgain { .. })
        ));
        assert!(!temp.path("cache/joblinks/job1/file1").exists());
        assert!(!temp.path("session/file1").exists());
    }

    #[test]
    fn test_link_modified_meanwhile() {
        let temp = TestDir::temp();
        let content = temp.path("cache/data").join(SUFFIX);
        let writer = content.clone();
        // Another host rewrites the entry while we wait out the second.
        let mut cache = cache_at(&temp, move || {
            std::fs::write(&writer, "new data").expect("write should succeed");
            set_file_mtime(&writer, FileTime::from_unix_time(FROZEN + 5, 0))
                .expect("set_file_mtime should succeed");
        });
        populate(&mut cache, URL, "data");
        cache.stop(URL).expect("stop should succeed");
        set_file_mtime(&content, FileTime::from_unix_time(FROZEN, 0))
            .expect("set_file_mtime should succeed");

        assert!(matches!(
            cache.link(temp.path("session/file1"), URL, LinkOptions::default()),
            Err(CacheError::TryAgain { .. })
        ));
        assert!(!temp.path("cache/joblinks/job1/file1").exists());
        assert!(!temp.path("session/file1").exists());
        assert_eq!(std::fs::read_to_string(&content).expect("should read"), "new data");
    }

    #[test]
    fn test_link_deleted_meanwhile() {
        let temp = TestDir::temp();
        let content = temp.path("cache/data").join(SUFFIX);
        let victim = content.clone();
        let mut cache = cache_at(&temp, move || {
            std::fs::remove_file(&victim).expect("remove should succeed");
        });
        populate(&mut cache, URL, "data");
        cache.stop(URL).expect("stop should succeed");
        set_file_mtime(&content, FileTime::from_unix_time(FROZEN, 0))
            .expect("set_file_mtime should succeed");

        assert!(matches!(
            cache.link(temp.path("session/file1"), URL, LinkOptions::default()),
            Err(CacheError::TryAgain { .. })
        ));
        assert!(!temp.path("cache/joblinks/job1/file1").exists());
        assert!(!temp.path("session/file1").exists());
    }

    #[test]
    fn test_unchanged() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);
        let content = populate(&mut cache, URL, "data");
        let host = FakeHost::new(PID, HOST, &[]);
        let lock = entry_lock(&content, &host);
        let snapshot = FileTime::from_unix_time(FROZEN, 0);
        set_file_mtime(&content, snapshot).expect("set_file_mtime should succeed");

        // Still locked by `populate`.
        assert!(!unchanged(&content, &lock, snapshot).expect("should succeed"));
        cache.stop(URL).expect("stop should succeed");
        assert!(unchanged(&content, &lock, snapshot).expect("should succeed"));

        set_file_mtime(&content, FileTime::from_unix_time(FROZEN + 1, 0))
            .expect("set_file_mtime should succeed");
        assert!(!unchanged(&content, &lock, snapshot).expect("should succeed"));

        // Gone after we hard linked it: our link keeps the data, but
        // the entry is not what we looked at.
        std::fs::remove_file(&content).expect("remove should succeed");
        assert!(!unchanged(&content, &lock, snapshot).expect("should succeed"));
    }

    #[test]
    fn test_link_copy() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);
        populate(&mut cache, URL, "data");

        let dest = temp.path("session/file1");
        cache
            .link(
                &dest,
                URL,
                LinkOptions::default().holding_lock(true).executable(true),
            )
            .expect("link should succeed");

        let meta = std::fs::symlink_metadata(&dest).expect("dest should exist");
        assert!(meta.file_type().is_file());
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        assert_eq!(std::fs::read_to_string(&dest).expect("should read"), "data");

        // Copies never overwrite.
        cache.start(URL, false).expect("start should succeed");
        assert!(matches!(
            cache.link(&dest, URL, LinkOptions::default().copy(true)),
            Err(CacheError::Io { .. })
        ));
    }

    #[test]
    fn test_link_alias() {
        let temp = TestDir::temp();
        let root = temp.path("cache");
        let mut cache = Cache::builder()
            .writer(format!("{} /mnt/cache", root.display()))
            .job("job1", unsafe { libc::getuid() }, unsafe { libc::getgid() })
            .host(Arc::new(crate::lock::testing::FakeHost::new(PID, HOST, &[])))
            .build();
        populate(&mut cache, URL, "data");

        let dest = temp.path("session/file1");
        cache
            .link(&dest, URL, LinkOptions::default().holding_lock(true))
            .expect("link should succeed");
        assert_eq!(
            std::fs::read_link(&dest).expect("dest is a symlink"),
            PathBuf::from("/mnt/cache/joblinks/job1/file1")
        );
    }

    #[test]
    fn test_link_forced_copy() {
        let temp = TestDir::temp();
        let root = temp.path("cache");
        let mut cache = Cache::builder()
            .writer(format!("{} .", root.display()))
            .job("job1", unsafe { libc::getuid() }, unsafe { libc::getgid() })
            .host(Arc::new(crate::lock::testing::FakeHost::new(PID, HOST, &[])))
            .build();
        populate(&mut cache, URL, "data");

        let dest = temp.path("session/file1");
        cache
            .link(&dest, URL, LinkOptions::default().holding_lock(true))
            .expect("link should succeed");

        let meta = std::fs::symlink_metadata(&dest).expect("dest should exist");
        assert!(meta.file_type().is_file());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_bad_destination() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);

        assert!(matches!(
            cache.link("/", URL, LinkOptions::default()),
            Err(CacheError::InvalidDestination(_))
        ));
    }

    #[test]
    fn test_release() {
        let temp = TestDir::temp();
        let mut job1 = cache_for("job1", &[&temp.path("cache")], PID);
        let mut job2 = cache_for("job2", &[&temp.path("cache")], PID);
        let path = populate(&mut job1, URL, "data");

        job1.link(
            temp.path("session1/file1"),
            URL,
            LinkOptions::default().holding_lock(true),
        )
        .expect("link should succeed");
        age(&path);
        job2.link(temp.path("session2/file1"), URL, LinkOptions::default())
            .expect("link should succeed");

        job1.release().expect("release should succeed");
        assert!(!temp.path("cache/joblinks/job1").exists());
        assert!(temp.path("cache/joblinks/job2/file1").exists());
        assert!(path.exists());

        // Idempotent.
        job1.release().expect("release should succeed");
        job2.release().expect("release should succeed");
        assert!(!temp.path("cache/joblinks/job2").exists());
    }

    #[test]
    fn test_release_after_caches_dropped() {
        let temp = TestDir::temp();
        let mut cache = cache_for("job1", &[&temp.path("cache")], PID);
        populate(&mut cache, URL, "data");
        cache
            .link(
                temp.path("session/file1"),
                URL,
                LinkOptions::default().holding_lock(true),
            )
            .expect("link should succeed");

        // The other URL's directory is blocked, so we give up on the
        // only writable cache.
        std::fs::write(temp.path(&format!("cache/data/{}", OTHER_DIR)), "")
            .expect("write should succeed");
        assert!(matches!(
            cache.start(OTHER_URL, false),
            Err(CacheError::NoWritableCache)
        ));
        assert!(!cache.is_usable());

        cache.release().expect("release should succeed");
        assert!(!temp.path("cache/joblinks/job1").exists());
    }

    #[test]
    fn test_release_all_caches() {
        let temp = TestDir::temp();
        let cache = Cache::builder()
            .writer(temp.path("w").to_string_lossy())
            .reader(temp.path("r").to_string_lossy())
            .draining(temp.path("d").to_string_lossy())
            .job("job1", 0, 0)
            .build();

        for root in &["w", "r", "d"] {
            std::fs::create_dir_all(temp.path(&format!("{}/joblinks/job1", root)))
                .expect("mkdir should succeed");
            std::fs::write(temp.path(&format!("{}/joblinks/job1/f", root)), "")
                .expect("write should succeed");
        }

        cache.release().expect("release should succeed");
        for root in &["w", "r", "d"] {
            assert!(!temp.path(&format!("{}/joblinks/job1", root)).exists());
            assert!(temp.path(&format!("{}/joblinks", root)).exists());
        }
    }
}
