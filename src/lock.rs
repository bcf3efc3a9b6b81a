//! Cooperative advisory locks, represented by `<path>.lock` files
//! that contain `"<pid>@<hostname>"`.
//!
//! A lock is taken by writing the owner string to a private temporary
//! file next to the lock, then hard linking it to the lock path: the
//! link either atomically publishes a complete lock file, or fails
//! with `EEXIST` because someone else holds the lock.  This works on
//! NFS, unlike `O_EXCL` on older servers and unlike `flock`.
//!
//! Nothing forces anyone to honour these locks, and nothing cleans
//! up after a crashed owner.  Instead, a lock is *stale*, and may be
//! broken by the next process that wants it, when either:
//!
//! - its mtime is older than the lock's timeout, or
//! - its owner is on this host, is not this process, and is not
//!   running anymore.
//!
//! Owners on other hosts can only go stale by timeout.  A lock owned
//! by the current process is never stale: we'd rather wait for the
//! timeout than stomp on our own work.
//!
//! Everything that depends on the environment (our identity, the
//! clock, the process table) goes through the [`Host`] trait, so the
//! staleness policy can be tested without real dead processes.
use std::fmt;
use std::io::ErrorKind;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::debug;
use tracing::warn;

use crate::benign_error::absent_as_none;
use crate::benign_error::ensure_file_removed;
use crate::cache_dir::append_suffix;
use crate::cache_dir::LOCK_SUFFIX;
use crate::error::CacheError;
use crate::error::IoResultExt;
use crate::error::Result;

/// Give up after this many rounds where the lock vanished or went
/// stale under us, without ever observing it busy.
const MAX_RACES: usize = 16;

/// The process that holds (or held) a lock.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.host)
    }
}

impl FromStr for LockOwner {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<LockOwner, Self::Err> {
        let s = s.trim();
        let (pid, host) = match s.find('@') {
            Some(index) => (&s[..index], &s[index + 1..]),
            // Let `parse` generate the error: "@" is not a number.
            None => ("@", ""),
        };

        Ok(LockOwner {
            pid: pid.parse()?,
            host: host.to_string(),
        })
    }
}

impl LockOwner {
    pub fn new(pid: u32, host: impl Into<String>) -> LockOwner {
        LockOwner {
            pid,
            host: host.into(),
        }
    }

    /// An empty host name means "wherever the reader is."
    fn is_local_to(&self, me: &LockOwner) -> bool {
        self.host.is_empty() || self.host == me.host
    }
}

/// The environment in which locks are taken and judged.
pub trait Host: Send + Sync {
    /// Returns the identity written to the lock files we create.
    fn owner(&self) -> &LockOwner;

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Returns whether process `pid` exists on this host.
    fn is_running(&self, pid: u32) -> bool;

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// The real host: our actual pid and hostname, the system clock,
/// and `kill(pid, 0)` to check for live processes.
#[derive(Clone, Debug)]
pub struct SystemHost {
    owner: LockOwner,
}

fn hostname() -> std::io::Result<String> {
    let mut buf = [0u8; 256];

    // Safety: the buffer is valid for `buf.len()` bytes.
    if unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // POSIX does not promise NUL termination on truncation.
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

impl SystemHost {
    pub fn new() -> std::io::Result<SystemHost> {
        Ok(SystemHost {
            owner: LockOwner::new(std::process::id(), hostname()?),
        })
    }

    /// Returns a host that identifies itself by pid only.  Its locks
    /// look local to every process that reads them.
    pub fn unnamed() -> SystemHost {
        SystemHost {
            owner: LockOwner::new(std::process::id(), ""),
        }
    }
}

impl Host for SystemHost {
    fn owner(&self) -> &LockOwner {
        &self.owner
    }

    fn is_running(&self, pid: u32) -> bool {
        if pid == 0 || pid > libc::pid_t::MAX as u32 {
            return false;
        }

        // Safety: signal 0 only checks for existence and permission.
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return true;
        }

        // EPERM means the process exists, but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// How hard to try for a busy lock before reporting it busy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub interval: Duration,
}

/// Result of a lock acquisition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockAttempt {
    /// We now hold the lock.  `stale_removed` is true if we first had
    /// to break a stale lock: whatever the previous owner was doing
    /// to the locked file is suspect.
    Acquired { stale_removed: bool },
    /// Someone else holds a live lock.
    Busy,
}

/// Who, if anyone, holds a lock right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockCheck {
    Owned,
    OtherOwner(LockOwner),
    Absent,
    /// The lock file exists but does not name an owner.
    Malformed,
}

/// What we found in an existing lock file.
struct Existing {
    owner: Option<LockOwner>,
    mtime: SystemTime,
    dev: u64,
    ino: u64,
}

impl Existing {
    /// Returns whether `other` describes the same, unmodified file.
    fn same_file(&self, other: &Existing) -> bool {
        self.dev == other.dev && self.ino == other.ino && self.mtime == other.mtime
    }
}

/// An advisory lock on `path`, materialised as `path.lock`.
pub struct FileLock<'a> {
    lock_path: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
    host: &'a dyn Host,
}

impl<'a> FileLock<'a> {
    /// Returns a handle for the lock on `path`.  Locks older than
    /// `timeout` are considered stale.
    pub fn new(path: &Path, timeout: Duration, retry: RetryPolicy, host: &'a dyn Host) -> Self {
        FileLock {
            lock_path: append_suffix(path, LOCK_SUFFIX),
            timeout,
            retry,
            host,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Returns whether the lock file exists, regardless of owner.
    pub fn exists(&self) -> Result<bool> {
        Ok(absent_as_none(std::fs::symlink_metadata(&self.lock_path))
            .at(&self.lock_path)?
            .is_some())
    }

    /// Attempts to publish our own lock file.  Returns false if a
    /// lock file already exists.
    fn try_create(&self) -> Result<bool> {
        let dir = self.lock_path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).at(dir)?;

        write!(tmp, "{}", self.host.owner()).at(tmp.path())?;
        match std::fs::hard_link(tmp.path(), &self.lock_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CacheError::io(&self.lock_path, e)),
        }
        // `tmp` is deleted on drop; the lock keeps the inode alive.
    }

    /// Reads the current lock file, if any.
    fn inspect(&self) -> Result<Option<Existing>> {
        let meta = match absent_as_none(std::fs::metadata(&self.lock_path)).at(&self.lock_path)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let mtime = meta.modified().at(&self.lock_path)?;

        let contents = match absent_as_none(std::fs::read(&self.lock_path)).at(&self.lock_path)? {
            Some(contents) => contents,
            None => return Ok(None),
        };

        Ok(Some(Existing {
            owner: String::from_utf8_lossy(&contents).parse().ok(),
            mtime,
            dev: meta.dev(),
            ino: meta.ino(),
        }))
    }

    /// Removes the lock file if it is still the one we saw.  Another
    /// process may have broken the stale lock and taken a fresh one
    /// since; that one must survive.  There is no atomic
    /// compare-and-unlink, so a small window remains.
    fn remove_if_unchanged(&self, seen: &Existing) -> Result<bool> {
        match self.inspect()? {
            Some(current) if current.same_file(seen) => {
                ensure_file_removed(&self.lock_path).at(&self.lock_path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Decides whether a lock held by `owner` (`None` if unknown)
    /// and last modified at `mtime` may be broken.
    pub fn is_stale(&self, owner: Option<&LockOwner>, mtime: SystemTime) -> bool {
        if let Ok(age) = self.host.now().duration_since(mtime) {
            if age > self.timeout {
                debug!(path = %self.lock_path.display(), ?age, "lock timed out");
                return true;
            }
        }

        let owner = match owner {
            Some(owner) => owner,
            None => return false,
        };

        let me = self.host.owner();
        if !owner.is_local_to(me) {
            return false;
        }

        if owner.pid == me.pid {
            warn!(path = %self.lock_path.display(), "this process already owns the lock");
            return false;
        }

        !self.host.is_running(owner.pid)
    }

    /// Attempts to take the lock, retrying a live lock according to
    /// the retry policy, and breaking stale locks.
    pub fn acquire(&self) -> Result<LockAttempt> {
        let mut stale_removed = false;
        let mut busy = 0;
        let mut races = 0;

        loop {
            if self.try_create()? {
                return Ok(LockAttempt::Acquired { stale_removed });
            }

            match self.inspect()? {
                // Released between our link attempt and our look.
                None => races += 1,
                Some(existing) if self.is_stale(existing.owner.as_ref(), existing.mtime) => {
                    if self.remove_if_unchanged(&existing)? {
                        warn!(
                            path = %self.lock_path.display(),
                            owner = ?existing.owner,
                            "removed stale lock"
                        );
                        stale_removed = true;
                    } else {
                        debug!(path = %self.lock_path.display(), "stale lock was replaced");
                    }

                    races += 1;
                }
                Some(existing) => {
                    busy += 1;
                    debug!(
                        path = %self.lock_path.display(),
                        owner = ?existing.owner,
                        busy,
                        "lock is busy"
                    );

                    if busy >= self.retry.attempts {
                        return Ok(LockAttempt::Busy);
                    }

                    self.host.sleep(self.retry.interval);
                }
            }

            if races > MAX_RACES {
                return Ok(LockAttempt::Busy);
            }
        }
    }

    /// Reports who holds the lock.
    pub fn check(&self) -> Result<LockCheck> {
        Ok(match self.inspect()? {
            None => LockCheck::Absent,
            Some(Existing { owner: None, .. }) => LockCheck::Malformed,
            Some(Existing {
                owner: Some(owner), ..
            }) => {
                let me = self.host.owner();
                if owner.is_local_to(me) && owner.pid == me.pid {
                    LockCheck::Owned
                } else {
                    LockCheck::OtherOwner(owner)
                }
            }
        })
    }

    /// Fails unless this process holds the lock.
    pub fn ensure_owned(&self) -> Result<()> {
        match self.check()? {
            LockCheck::Owned => Ok(()),
            LockCheck::Absent => Err(CacheError::LockNotHeld {
                path: self.lock_path.clone(),
            }),
            LockCheck::Malformed => Err(CacheError::MalformedLock {
                path: self.lock_path.clone(),
            }),
            LockCheck::OtherOwner(owner) => Err(CacheError::LockOwnedByOther {
                path: self.lock_path.clone(),
                owner,
            }),
        }
    }

    /// Releases the lock, only if we own it.  Any other state is an
    /// error, and leaves the lock file alone.
    pub fn release(&self) -> Result<()> {
        self.ensure_owned()?;
        self.force_release()
    }

    /// Removes the lock file, whoever owns it.
    pub fn force_release(&self) -> Result<()> {
        ensure_file_removed(&self.lock_path).at(&self.lock_path)
    }
}


#[cfg(test)]
mod test {
    use super::testing::FakeHost;
    use super::*;
    use filetime::FileTime;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;
    use test_dir::{DirBuilder, TestDir};

    const TIMEOUT: Duration = Duration::from_secs(30);
    const RETRY: RetryPolicy = RetryPolicy {
        attempts: 2,
        interval: Duration::from_millis(10),
    };

    fn write_lock(lock: &FileLock, contents: &str) {
        std::fs::write(lock.lock_path(), contents).expect("write should succeed");
    }

    fn age_lock(lock: &FileLock) {
        filetime::set_file_mtime(lock.lock_path(), FileTime::from_unix_time(1, 0))
            .expect("set_file_mtime should succeed");
    }

    #[test]
    fn test_parse_owner() {
        assert_eq!(
            "123@host.org".parse::<LockOwner>(),
            Ok(LockOwner::new(123, "host.org"))
        );
        assert_eq!("123@\n".parse::<LockOwner>(), Ok(LockOwner::new(123, "")));
        assert!("abcd@host.org".parse::<LockOwner>().is_err());
        assert!("".parse::<LockOwner>().is_err());
        assert!("123".parse::<LockOwner>().is_err());
        assert_eq!(LockOwner::new(7, "h").to_string(), "7@h");
    }

    #[test]
    fn test_acquire_fresh() {
        let temp = TestDir::temp();
        let host = FakeHost::new(100, "here", &[]);
        let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);

        assert_eq!(
            lock.acquire().expect("acquire should succeed"),
            LockAttempt::Acquired {
                stale_removed: false
            }
        );
        assert_eq!(
            std::fs::read_to_string(lock.lock_path()).expect("lock should exist"),
            "100@here"
        );
        assert_eq!(lock.check().expect("check should succeed"), LockCheck::Owned);

        // We never steal our own lock.
        assert_eq!(
            lock.acquire().expect("acquire should succeed"),
            LockAttempt::Busy
        );
    }

    #[test]
    fn test_replaced_stale_lock_survives() {
        let temp = TestDir::temp();
        let host = FakeHost::new(100, "here", &[]);
        let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);

        write_lock(&lock, "99999@here");
        age_lock(&lock);
        let seen = lock
            .inspect()
            .expect("inspect should succeed")
            .expect("lock exists");

        // Someone else breaks the stale lock and takes a fresh one.
        std::fs::remove_file(lock.lock_path()).expect("remove should succeed");
        std::fs::write(temp.path("fresh"), "200@here").expect("write should succeed");
        std::fs::rename(temp.path("fresh"), lock.lock_path()).expect("rename should succeed");

        assert!(!lock.remove_if_unchanged(&seen).expect("should succeed"));
        assert_eq!(
            std::fs::read_to_string(lock.lock_path()).expect("lock should survive"),
            "200@here"
        );

        let current = lock
            .inspect()
            .expect("inspect should succeed")
            .expect("lock exists");
        assert!(lock.remove_if_unchanged(&current).expect("should succeed"));
        assert!(!lock.exists().expect("exists should succeed"));
    }

    #[test]
    fn test_acquire_timed_out() {
        let temp = TestDir::temp();
        let host = FakeHost::new(100, "here", &[]);
        let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);

        lock.acquire().expect("acquire should succeed");
        age_lock(&lock);

        assert_eq!(
            lock.acquire().expect("acquire should succeed"),
            LockAttempt::Acquired {
                stale_removed: true
            }
        );
    }

    #[test]
    fn test_acquire_live_and_dead_owners() {
        let temp = TestDir::temp();
        let host = FakeHost::new(100, "here", &[1]);
        let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);

        // Running process on this host.
        write_lock(&lock, "1@here");
        assert_eq!(lock.acquire().expect("should succeed"), LockAttempt::Busy);

        // Any process on another host.
        write_lock(&lock, "99999@elsewhere.org");
        assert_eq!(lock.acquire().expect("should succeed"), LockAttempt::Busy);

        // Badly formatted pid.
        write_lock(&lock, "abcd@here");
        assert_eq!(lock.acquire().expect("should succeed"), LockAttempt::Busy);

        // Empty lock file.
        write_lock(&lock, "");
        assert_eq!(lock.acquire().expect("should succeed"), LockAttempt::Busy);

        // Dead process on this host.
        write_lock(&lock, "99999@here");
        assert_eq!(
            lock.acquire().expect("should succeed"),
            LockAttempt::Acquired {
                stale_removed: true
            }
        );

        // Dead process with an empty host name.
        write_lock(&lock, "99999@");
        assert_eq!(
            lock.acquire().expect("should succeed"),
            LockAttempt::Acquired {
                stale_removed: true
            }
        );
    }

    #[test]
    fn test_malformed_times_out() {
        let temp = TestDir::temp();
        let host = FakeHost::new(100, "here", &[]);
        let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);

        write_lock(&lock, "");
        assert_eq!(lock.check().expect("should succeed"), LockCheck::Malformed);
        age_lock(&lock);

        assert_eq!(
            lock.acquire().expect("should succeed"),
            LockAttempt::Acquired {
                stale_removed: true
            }
        );
    }

    #[test]
    fn test_release() {
        let temp = TestDir::temp();
        let host = FakeHost::new(100, "here", &[1]);
        let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);

        assert!(matches!(
            lock.release(),
            Err(CacheError::LockNotHeld { .. })
        ));

        write_lock(&lock, "100@here");
        lock.release().expect("release should succeed");
        assert!(!lock.exists().expect("should succeed"));

        write_lock(&lock, "1@here");
        assert!(matches!(
            lock.release(),
            Err(CacheError::LockOwnedByOther { owner, .. }) if owner == LockOwner::new(1, "here")
        ));
        assert!(lock.exists().expect("should succeed"));

        write_lock(&lock, "100@elsewhere.org");
        assert!(matches!(
            lock.release(),
            Err(CacheError::LockOwnedByOther { .. })
        ));

        lock.force_release().expect("force should succeed");
        assert!(!lock.exists().expect("should succeed"));

        write_lock(&lock, "");
        assert!(matches!(
            lock.release(),
            Err(CacheError::MalformedLock { .. })
        ));

        write_lock(&lock, "100@");
        lock.release().expect("release should succeed");
    }

    #[test]
    fn test_is_stale_by_age() {
        let temp = TestDir::temp();
        let host = FakeHost::new(100, "here", &[1]);
        let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);
        let now = SystemTime::now();
        let live = LockOwner::new(1, "here");

        assert!(!lock.is_stale(Some(&live), now));
        assert!(!lock.is_stale(None, now));
        assert!(lock.is_stale(Some(&live), now - 2 * TIMEOUT));
        assert!(lock.is_stale(None, now - 2 * TIMEOUT));
        // Clock skew: a lock from the future is not stale.
        assert!(!lock.is_stale(Some(&live), now + TIMEOUT));
    }

    /// Who left a lock file behind, in the acquisition oracle.
    #[derive(Arbitrary, Clone, Copy, Debug)]
    enum Holder {
        Nobody,
        Me,
        LiveHere,
        DeadHere,
        DeadNoHost,
        Elsewhere,
        Garbage,
    }

    proptest! {
        /// Acquisition only breaks locks that are old, or whose owner
        /// is provably dead.
        #[test]
        fn test_acquire_oracle(holder in any::<Holder>(), old in any::<bool>()) {
            let temp = TestDir::temp();
            let host = FakeHost::new(100, "here", &[1]);
            let lock = FileLock::new(&temp.path("file"), TIMEOUT, RETRY, &host);

            let contents = match holder {
                Holder::Nobody => None,
                Holder::Me => Some("100@here"),
                Holder::LiveHere => Some("1@here"),
                Holder::DeadHere => Some("2@here"),
                Holder::DeadNoHost => Some("2@"),
                Holder::Elsewhere => Some("2@elsewhere.org"),
                Holder::Garbage => Some("garbage"),
            };

            if let Some(contents) = contents {
                write_lock(&lock, contents);
                if old {
                    age_lock(&lock);
                }
            }

            let expected = match (holder, old) {
                (Holder::Nobody, _) => LockAttempt::Acquired { stale_removed: false },
                (Holder::DeadHere, _) | (Holder::DeadNoHost, _) | (_, true) => {
                    LockAttempt::Acquired { stale_removed: true }
                }
                _ => LockAttempt::Busy,
            };

            assert_eq!(lock.acquire().expect("acquire should succeed"), expected);
        }
    }

    #[test]
    fn test_system_host() {
        let host = SystemHost::new().expect("hostname should be available");

        assert_eq!(host.owner().pid, std::process::id());
        assert!(host.is_running(std::process::id()));
        assert!(!host.is_running(0));
        assert!(!host.is_running(u32::MAX));
    }
}
