//! A `CacheSpec` describes one configured cache directory, and knows
//! where each kind of file lives under it:
//!
//! ```text
//! <root>/data/<hash[0:L]>/<hash[L:]>          content file
//! <root>/data/<hash[0:L]>/<hash[L:]>.meta     meta file
//! <root>/data/<hash[0:L]>/<hash[L:]>.lock     lock file
//! <root>/joblinks/<job_id>/<basename>         per-job hard links
//! ```
use std::ffi::OsString;
use std::io::ErrorKind;
use std::io::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CacheError;

/// Cached data and their meta and lock files live under this
/// subdirectory of each cache root.
pub const DATA_SUBDIR: &str = "data";

/// Per-job hard links live under this subdirectory of each cache root.
pub const JOBLINKS_SUBDIR: &str = "joblinks";

/// A cache whose alias is this string always copies files to their
/// destination instead of symlinking them.
pub const COPY_ALIAS: &str = ".";

pub const META_SUFFIX: &str = ".meta";
pub const LOCK_SUFFIX: &str = ".lock";

/// Returns `path` with `suffix` appended to its file name.
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Succeeds if whatever already exists at `dir` is a directory (or a
/// symlink to one).
fn check_existing_dir(dir: &Path) -> Result<()> {
    if std::fs::metadata(dir)?.is_dir() {
        Ok(())
    } else {
        Err(std::io::Error::from_raw_os_error(libc::ENOTDIR))
    }
}

/// Creates `dir` and its missing parents.  Only the final directory
/// gets `mode`; parents get the process default.
pub fn ensure_dir(dir: &Path, mode: u32) -> Result<()> {
    match std::fs::create_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return check_existing_dir(dir),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent)?;
            }

            match std::fs::create_dir(dir) {
                Ok(()) => {}
                // Someone else won the race; they own the mode.
                Err(e) if e.kind() == ErrorKind::AlreadyExists => return check_existing_dir(dir),
                err => err?,
            }
        }
        err => err?,
    }

    // `create_dir` is subject to the umask.
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))
}

/// One configured cache directory, plus the optional path under
/// which the same storage is visible from the job's side.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheSpec {
    root: PathBuf,
    alias: Option<String>,
}

fn trim_trailing_slashes(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && !path.is_empty() {
        "/"
    } else {
        trimmed
    }
}

impl FromStr for CacheSpec {
    type Err = CacheError;

    /// Parses `"<root_path>[ <alias_path>]"`.
    fn from_str(spec: &str) -> std::result::Result<CacheSpec, CacheError> {
        let mut words = spec.split_whitespace();
        let root = match words.next() {
            Some(root) => root,
            None => return Err(CacheError::InvalidConfig("empty cache directory".into())),
        };
        let alias = words.next();

        if words.next().is_some() {
            return Err(CacheError::InvalidConfig(format!(
                "too many fields in cache directory {:?}",
                spec
            )));
        }

        Ok(CacheSpec::new(root, alias))
    }
}

impl CacheSpec {
    pub fn new(root: impl AsRef<str>, alias: Option<&str>) -> CacheSpec {
        CacheSpec {
            root: PathBuf::from(trim_trailing_slashes(root.as_ref())),
            alias: alias.map(|alias| match alias {
                COPY_ALIAS => COPY_ALIAS.to_string(),
                _ => trim_trailing_slashes(alias).to_string(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Returns whether files from this cache must always be copied
    /// out rather than symlinked.
    pub fn forces_copy(&self) -> bool {
        self.alias.as_deref() == Some(COPY_ALIAS)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_SUBDIR)
    }

    /// Returns the content file path for the relative address `rel`.
    pub fn content_path(&self, rel: &Path) -> PathBuf {
        let mut path = self.data_dir();
        path.push(rel);
        path
    }

    /// Returns the directory of hard links for `job_id`.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        let mut path = self.root.join(JOBLINKS_SUBDIR);
        path.push(job_id);
        path
    }

    /// Returns the path that symlinks should point to for the hard
    /// link at `hard_link`: the same path, seen through the alias if
    /// there is one.
    pub fn link_target(&self, hard_link: &Path) -> PathBuf {
        match self.alias.as_deref() {
            Some(alias) if alias != COPY_ALIAS => match hard_link.strip_prefix(&self.root) {
                Ok(rest) => Path::new(alias).join(rest),
                Err(_) => hard_link.to_owned(),
            },
            _ => hard_link.to_owned(),
        }
    }

    /// Returns the number of bytes available to unprivileged users
    /// on the filesystem that holds this cache.
    pub fn free_space(&self) -> Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = CString::new(self.root.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;
        // Safety: `statvfs` is plain old data, and we pass valid
        // pointers to a NUL-terminated path and to the struct.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
            return Err(std::io::Error::last_os_error());
        }

        #[allow(clippy::unnecessary_cast)]
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[test]
fn test_parse() {
    let spec: CacheSpec = "/var/cache/grid".parse().expect("valid spec");
    assert_eq!(spec.root(), Path::new("/var/cache/grid"));
    assert_eq!(spec.alias(), None);
    assert!(!spec.forces_copy());

    let spec: CacheSpec = "/var/cache/grid/ /mnt/grid/".parse().expect("valid spec");
    assert_eq!(spec.root(), Path::new("/var/cache/grid"));
    assert_eq!(spec.alias(), Some("/mnt/grid"));

    let spec: CacheSpec = "/var/cache/grid .".parse().expect("valid spec");
    assert!(spec.forces_copy());

    assert!(matches!(
        "".parse::<CacheSpec>(),
        Err(CacheError::InvalidConfig(_))
    ));
    assert!(matches!(
        "/a /b /c".parse::<CacheSpec>(),
        Err(CacheError::InvalidConfig(_))
    ));
}

#[test]
fn test_paths() {
    let spec = CacheSpec::new("/cache", Some("/mnt/cache"));

    assert_eq!(
        spec.content_path(Path::new("8a/929b")),
        PathBuf::from("/cache/data/8a/929b")
    );
    assert_eq!(spec.job_dir("job1"), PathBuf::from("/cache/joblinks/job1"));
    assert_eq!(
        spec.link_target(&spec.job_dir("job1").join("file")),
        PathBuf::from("/mnt/cache/joblinks/job1/file")
    );
    assert_eq!(
        append_suffix(Path::new("/cache/data/8a/929b"), LOCK_SUFFIX),
        PathBuf::from("/cache/data/8a/929b.lock")
    );

    let plain = CacheSpec::new("/cache", None);
    assert_eq!(
        plain.link_target(Path::new("/cache/joblinks/job1/file")),
        PathBuf::from("/cache/joblinks/job1/file")
    );
}

#[test]
fn test_ensure_dir() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = temp.path("a/b/c");

    ensure_dir(&dir, 0o700).expect("creation should succeed");
    let mode = std::fs::metadata(&dir)
        .expect("dir should exist")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o700);

    // Existing directories are left alone.
    ensure_dir(&dir, 0o755).expect("creation should succeed");
    let mode = std::fs::metadata(&dir)
        .expect("dir should exist")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o700);

    // A regular file in the way is not a directory.
    let file = temp.path("a/b/file");
    std::fs::write(&file, "").expect("write should succeed");
    let err = ensure_dir(&file, 0o700).expect_err("a file is not a directory");
    assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
}

#[test]
fn test_free_space() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let spec = CacheSpec::new(temp.path(".").to_string_lossy(), None);
    assert!(spec.free_space().is_ok());

    let missing = CacheSpec::new(temp.path("missing").to_string_lossy(), None);
    assert!(missing.free_space().is_err());
}
