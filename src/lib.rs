//! Gridcache implements a shared cache of job input files, stored
//! in filesystem directories that any number of processes, possibly
//! on many hosts mounting the same (NFS) filesystem, access without
//! any central coordinator.  Processes coordinate through lock files,
//! hard links and modification times only.
//!
//! Each cached object is identified by its URL, and addressed by the
//! SHA-1 of that URL.  An entry consists of three files under the
//! `data` subdirectory of one of the configured cache directories:
//!
//! ```text
//! <root>/data/8a/929b8384300813ba1dd2d661c42835b80691a2        content
//! <root>/data/8a/929b8384300813ba1dd2d661c42835b80691a2.meta   owner URL, permissions
//! <root>/data/8a/929b8384300813ba1dd2d661c42835b80691a2.lock   "<pid>@<hostname>"
//! ```
//!
//! A job gets at a cached file in three steps:
//!
//! 1. [`Cache::start`] reports whether the object is available.  If it
//!    is not, and nobody else is downloading it, the caller now holds
//!    the entry's lock and should download to [`Cache::file`].
//! 2. [`Cache::link`] hard links the content into a per-job directory
//!    (`<root>/joblinks/<job_id>/`), and gives the job a symlink to or
//!    a copy of that hard link.  The hard link keeps the data alive
//!    even if the entry is later deleted or re-populated.
//! 3. [`Cache::stop`] releases the entry lock, if we held it, or
//!    [`Cache::stop_and_delete`] throws away a failed download.
//!
//! Once the job is done, [`Cache::release`] removes all of its hard
//! links at once.
//!
//! Locks are advisory.  A process that crashes while holding one
//! leaves the lock behind; the next process that wants the entry
//! breaks the lock once it is *stale*: older than its timeout, or
//! owned by a process on the same host that is not running anymore.
//! Whatever the crashed writer left in the content file is then
//! discarded.
//!
//! `link` never holds the entry lock for long.  It hard links the
//! content without any lock, then checks that no writer touched the
//! entry meanwhile, and backs out with [`CacheError::TryAgain`] if one
//! did.  Callers should treat `TryAgain` (and a `Locked` outcome) as
//! a reason to come back later, or to fetch the object without the
//! cache.
//!
//! # Cache directories
//!
//! A [`Cache`] is built for one job from three lists of cache
//! directories, each given as `"<root_path>[ <alias_path>]"`:
//!
//! - writable caches receive new downloads.  New entries go to a
//!   writable cache picked at random, weighted by free space;
//! - read-only caches are searched for existing content, but never
//!   receive new entries;
//! - draining caches are being emptied, and are only visited by
//!   [`Cache::release`].
//!
//! The alias, if any, is the path under which the cache directory is
//! visible to jobs; symlinks given to jobs go through the alias.  An
//! alias of `.` makes `link` copy files instead.
//!
//! # Permissions and validity
//!
//! The meta file also remembers which DNs were recently allowed to
//! read the object at its source ([`Cache::add_dn`],
//! [`Cache::check_dn`]), and until when the cached copy is valid
//! ([`Cache::set_valid`], [`Cache::valid_until`]).
mod address;
mod benign_error;
mod cache;
mod cache_dir;
mod claim;
mod config;
mod entry;
mod error;
pub mod lock;
mod meta;
mod permission;
pub mod placement;

pub use address::Addressor;
pub use address::hash_url;
pub use cache::Cache;
pub use cache::CacheBuilder;
pub use cache_dir::CacheSpec;
pub use cache_dir::DATA_SUBDIR;
pub use cache_dir::JOBLINKS_SUBDIR;
pub use claim::LinkOptions;
pub use config::CacheConfig;
pub use entry::ENTRY_LOCK_TIMEOUT;
pub use entry::StartOutcome;
pub use error::CacheError;
pub use error::Result;
pub use meta::format_time;
pub use meta::parse_expiry;
pub use permission::META_LOCK_TIMEOUT;
