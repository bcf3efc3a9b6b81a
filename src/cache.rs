//! A [`Cache`] is one job's view of the configured cache directories.
//! It resolves URLs to entries, and remembers which cache directory
//! backs each URL for as long as it lives, so that every operation
//! on a URL sees the same entry.
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use derivative::Derivative;
use tracing::debug;
use tracing::warn;

use crate::address::Addressor;
use crate::benign_error::absent_as_none;
use crate::cache_dir::append_suffix;
use crate::cache_dir::CacheSpec;
use crate::cache_dir::LOCK_SUFFIX;
use crate::cache_dir::META_SUFFIX;
use crate::error::CacheError;
use crate::error::Result;
use crate::lock::Host;
use crate::lock::SystemHost;
use crate::placement;

/// Why a `Cache` refuses to do anything.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Invalid {
    NoWritable,
    Layout { levels: usize, length: usize },
    Config(String),
}

impl Invalid {
    fn to_error(&self) -> CacheError {
        match self {
            Invalid::NoWritable => CacheError::NoWritableCache,
            Invalid::Layout { levels, length } => CacheError::InvalidLayout {
                levels: *levels,
                length: *length,
            },
            Invalid::Config(message) => CacheError::InvalidConfig(message.clone()),
        }
    }
}

/// The cache directory chosen for a URL, and the entry's content
/// path in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) cache: CacheSpec,
    pub(crate) content: PathBuf,
}

impl Binding {
    pub(crate) fn meta_path(&self) -> PathBuf {
        append_suffix(&self.content, META_SUFFIX)
    }
}

/// Construct a [`Cache`] with this builder.  Writable caches receive
/// new downloads, read-only caches are only searched for existing
/// content, and draining caches are only cleaned up by
/// [`Cache::release`].
///
/// Cache directories are given as `"<root_path>[ <alias_path>]"`.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct CacheBuilder {
    writable: Vec<CacheSpec>,
    readonly: Vec<CacheSpec>,
    draining: Vec<CacheSpec>,
    job_id: String,
    uid: u32,
    gid: u32,
    layout: Option<(usize, usize)>,
    errors: Vec<String>,
    #[derivative(Debug = "ignore")]
    host: Option<Arc<dyn Host>>,
}

/// One job's handle on a set of shared cache directories.
///
/// A `Cache` is cheap to build and is meant to live for the duration
/// of a job's staging.  It is not shared between threads; processes
/// (and other `Cache` values) coordinate through lock files only.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Cache {
    pub(crate) writable: Vec<CacheSpec>,
    pub(crate) readonly: Vec<CacheSpec>,
    pub(crate) draining: Vec<CacheSpec>,
    // Writable caches we gave up on.  Still cleaned up by `release`.
    pub(crate) failed: Vec<CacheSpec>,
    pub(crate) job_id: String,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    addressor: Addressor,
    invalid: Option<Invalid>,
    #[derivative(Debug = "ignore")]
    pub(crate) host: Arc<dyn Host>,
    bindings: HashMap<String, Binding>,
    // URLs whose entry lock `link` already released for us.
    pub(crate) released: HashSet<String>,
}

impl PartialEq for Cache {
    fn eq(&self, other: &Cache) -> bool {
        self.writable == other.writable
            && self.readonly == other.readonly
            && self.draining == other.draining
            && self.job_id == other.job_id
            && self.uid == other.uid
            && self.gid == other.gid
            && self.addressor == other.addressor
    }
}

/// Returns whether a job id names a single, ordinary directory.
fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty() && job_id != "." && job_id != ".." && !job_id.contains('/')
}

impl CacheBuilder {
    /// Returns a fresh empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(&mut self, spec: &str) -> Option<CacheSpec> {
        match spec.parse::<CacheSpec>() {
            Ok(spec) => Some(spec),
            Err(e) => {
                self.errors.push(e.to_string());
                None
            }
        }
    }

    /// Adds a writable cache directory.
    pub fn writer(mut self, spec: impl AsRef<str>) -> Self {
        if let Some(spec) = self.parse(spec.as_ref()) {
            self.writable.push(spec);
        }
        self
    }

    /// Adds a read-only cache directory to the end of the search list.
    pub fn reader(mut self, spec: impl AsRef<str>) -> Self {
        if let Some(spec) = self.parse(spec.as_ref()) {
            self.readonly.push(spec);
        }
        self
    }

    /// Adds a cache directory that is being emptied: only job links
    /// are cleaned up there.
    pub fn draining(mut self, spec: impl AsRef<str>) -> Self {
        if let Some(spec) = self.parse(spec.as_ref()) {
            self.draining.push(spec);
        }
        self
    }

    /// Sets the job on whose behalf we cache files, and the local
    /// user and group that should own the job's links and copies.
    pub fn job(mut self, job_id: impl Into<String>, uid: u32, gid: u32) -> Self {
        self.job_id = job_id.into();
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Splits hashes into `levels` directories of `length`
    /// characters, instead of the default single level of two.
    pub fn layout(mut self, levels: usize, length: usize) -> Self {
        self.layout = Some((levels, length));
        self
    }

    /// Overrides the process identity, clock and process table.
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Returns a fresh `Cache`.  Configuration problems do not fail
    /// here; they make the cache unusable instead, and every
    /// operation on it reports the problem.
    pub fn build(self) -> Cache {
        let mut invalid = None;

        let addressor = match self.layout {
            None => Addressor::default(),
            Some((levels, length)) => Addressor::new(levels, length).unwrap_or_else(|| {
                invalid.get_or_insert(Invalid::Layout { levels, length });
                Addressor::default()
            }),
        };

        if let Some(error) = self.errors.into_iter().next() {
            invalid.get_or_insert(Invalid::Config(error));
        }

        if !is_valid_job_id(&self.job_id) {
            invalid.get_or_insert(Invalid::Config(format!(
                "invalid job id {:?}",
                self.job_id
            )));
        }

        if self.writable.is_empty() {
            invalid.get_or_insert(Invalid::NoWritable);
        }

        let host: Arc<dyn Host> = match self.host {
            Some(host) => host,
            None => match SystemHost::new() {
                Ok(host) => Arc::new(host),
                Err(e) => {
                    invalid.get_or_insert(Invalid::Config(format!(
                        "failed to find host name: {}",
                        e
                    )));
                    Arc::new(SystemHost::unnamed())
                }
            },
        };

        if let Some(invalid) = &invalid {
            warn!(error = %invalid.to_error(), "cache is unusable");
        }

        Cache {
            writable: self.writable,
            readonly: self.readonly,
            draining: self.draining,
            failed: Vec::new(),
            job_id: self.job_id,
            uid: self.uid,
            gid: self.gid,
            addressor,
            invalid,
            host,
            bindings: HashMap::new(),
            released: HashSet::new(),
        }
    }
}

/// Returns whether anything exists at `path`.  Errors other than
/// absence are logged and count as absence: a cache we cannot even
/// stat is no good to us.
fn exists(path: &Path) -> bool {
    match absent_as_none(std::fs::symlink_metadata(path)) {
        Ok(found) => found.is_some(),
        Err(e) => {
            warn!(path = %path.display(), %e, "failed to stat cache file");
            false
        }
    }
}

impl Cache {
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn writable_caches(&self) -> &[CacheSpec] {
        &self.writable
    }

    pub fn readonly_caches(&self) -> &[CacheSpec] {
        &self.readonly
    }

    pub fn draining_caches(&self) -> &[CacheSpec] {
        &self.draining
    }

    /// Returns whether this cache can be used at all.  An unusable
    /// cache fails every operation.
    pub fn is_usable(&self) -> bool {
        self.invalid.is_none()
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        match &self.invalid {
            None => Ok(()),
            Some(invalid) => Err(invalid.to_error()),
        }
    }

    /// Fails only if the configuration itself is bad.  Running out of
    /// writable caches does not count: their job links must still be
    /// cleaned up.
    pub(crate) fn check_configured(&self) -> Result<()> {
        match &self.invalid {
            None | Some(Invalid::NoWritable) => Ok(()),
            Some(invalid) => Err(invalid.to_error()),
        }
    }

    /// Returns the per-job link directory in every configured cache.
    pub fn job_dirs(&self) -> Vec<PathBuf> {
        self.writable
            .iter()
            .chain(self.failed.iter())
            .chain(self.readonly.iter())
            .chain(self.draining.iter())
            .map(|cache| cache.job_dir(&self.job_id))
            .collect()
    }

    /// Returns the content file path for `url`.  The first call for a
    /// URL picks a cache directory; later calls on the same `Cache`
    /// return the same path.
    pub fn file(&mut self, url: &str) -> Result<PathBuf> {
        Ok(self.bind(url)?.content)
    }

    pub(crate) fn bind(&mut self, url: &str) -> Result<Binding> {
        self.check_usable()?;

        if let Some(binding) = self.bindings.get(url) {
            return Ok(binding.clone());
        }

        self.rebind(url, true)
    }

    /// Like `bind`, but only ever returns a writable cache.  A URL
    /// bound to a read-only cache moves to a writable one.
    pub(crate) fn bind_writable(&mut self, url: &str) -> Result<Binding> {
        let binding = self.bind(url)?;
        if self.is_writable(&binding.cache) {
            return Ok(binding);
        }

        debug!(%url, root = %binding.cache.root().display(), "moving url off read-only cache");
        self.rebind(url, false)
    }

    pub(crate) fn is_writable(&self, cache: &CacheSpec) -> bool {
        self.writable.contains(cache)
    }

    fn rebind(&mut self, url: &str, with_readonly: bool) -> Result<Binding> {
        let rel = self
            .addressor
            .relative_path(url)
            .ok_or(CacheError::EmptyUrl)?;
        let cache = self.select(&rel, with_readonly)?;
        let binding = Binding {
            content: cache.content_path(&rel),
            cache,
        };

        debug!(%url, path = %binding.content.display(), "bound url to cache");
        self.bindings.insert(url.to_string(), binding.clone());
        Ok(binding)
    }

    /// Picks the cache directory for the relative address `rel`.
    /// Read-only caches are only considered `with_readonly`.
    fn select(&self, rel: &Path, with_readonly: bool) -> Result<CacheSpec> {
        let readonly: &[CacheSpec] = if with_readonly { &self.readonly } else { &[] };
        if self.writable.len() == 1 && readonly.is_empty() {
            return Ok(self.writable[0].clone());
        }

        // Existing content wins, so we never duplicate a file.
        if let Some(cache) = self
            .writable
            .iter()
            .chain(readonly.iter())
            .find(|cache| exists(&cache.content_path(rel)))
        {
            return Ok(cache.clone());
        }

        // Someone may be downloading without any content yet.
        if let Some(cache) = self
            .writable
            .iter()
            .find(|cache| exists(&append_suffix(&cache.content_path(rel), LOCK_SUFFIX)))
        {
            return Ok(cache.clone());
        }

        let free: Vec<u64> = self
            .writable
            .iter()
            .map(|cache| {
                cache.free_space().unwrap_or_else(|e| {
                    warn!(root = %cache.root().display(), %e, "failed to query free space");
                    0
                })
            })
            .collect();

        placement::pick(&free)
            .map(|index| self.writable[index].clone())
            .ok_or(CacheError::NoWritableCache)
    }

    /// Stops using the writable cache `cache` for the rest of this
    /// `Cache`'s life, and forgets every URL bound to it.
    pub(crate) fn drop_writable(&mut self, cache: &CacheSpec) {
        warn!(root = %cache.root().display(), "giving up on writable cache");

        if let Some(index) = self.writable.iter().position(|c| c == cache) {
            let dropped = self.writable.remove(index);
            self.failed.push(dropped);
        }

        self.bindings.retain(|_, binding| binding.cache != *cache);
        if self.writable.is_empty() {
            self.invalid.get_or_insert(Invalid::NoWritable);
        }
    }
}
