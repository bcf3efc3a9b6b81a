//! Site-wide cache configuration, usually loaded from a TOML file:
//!
//! ```toml
//! cache_dirs = ["/var/cache/grid /mnt/grid-cache", "/scratch/cache"]
//! readonly_cache_dirs = ["/shared/cache"]
//! draining_cache_dirs = ["/old/cache"]
//! levels = 1
//! length = 2
//! ```
//!
//! Every field is optional.  The job identity is not part of the
//! configuration; it is added to the [`CacheBuilder`] per job.
use std::path::Path;

use serde::Deserialize;

use crate::address::DEFAULT_LENGTH;
use crate::address::DEFAULT_LEVELS;
use crate::cache::CacheBuilder;
use crate::error::CacheError;
use crate::error::IoResultExt;
use crate::error::Result;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Writable caches, as `"<root_path>[ <alias_path>]"`.
    pub cache_dirs: Vec<String>,
    pub readonly_cache_dirs: Vec<String>,
    pub draining_cache_dirs: Vec<String>,
    pub levels: usize,
    pub length: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_dirs: Vec::new(),
            readonly_cache_dirs: Vec::new(),
            draining_cache_dirs: Vec::new(),
            levels: DEFAULT_LEVELS,
            length: DEFAULT_LENGTH,
        }
    }
}

impl CacheConfig {
    pub fn from_toml_str(text: &str) -> Result<CacheConfig> {
        toml::from_str(text).map_err(|e| CacheError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<CacheConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).at(path)?;
        CacheConfig::from_toml_str(&text)
    }

    /// Returns a builder for caches with this configuration.  Call
    /// [`CacheBuilder::job`] on it before building.
    pub fn builder(&self) -> CacheBuilder {
        let mut builder = CacheBuilder::new().layout(self.levels, self.length);

        for spec in &self.cache_dirs {
            builder = builder.writer(spec);
        }

        for spec in &self.readonly_cache_dirs {
            builder = builder.reader(spec);
        }

        for spec in &self.draining_cache_dirs {
            builder = builder.draining(spec);
        }

        builder
    }
}
