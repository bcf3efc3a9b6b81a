//! Each cache entry has a `.meta` file next to its content.  The
//! first line names the URL that owns the entry, optionally followed
//! by the time until which the cached copy is valid.  Every other
//! line is a permission record: a DN that was recently authorised to
//! read the source, and when that authorisation expires.
//!
//! ```text
//! http://host.org/file1 20301231235959Z
//! /O=Grid/CN=Some User 20301231120000Z
//! ```
//!
//! Times are UTC and fixed-width, `YYYYMMDDHHMMSSZ`.  DNs may contain
//! spaces, so a record's expiry is always its last word.
//!
//! Meta files are only ever replaced atomically, by renaming a fully
//! written temporary file over them; readers never need a lock.
use std::io::Write;
use std::path::Path;

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::TimeZone;
use chrono::Utc;
use tempfile::NamedTempFile;

use crate::benign_error::absent_as_none;
use crate::error::CacheError;
use crate::error::IoResultExt;
use crate::error::Result;

const TIME_FORMAT: &str = "%Y%m%d%H%M%SZ";
const TIME_LENGTH: usize = 15;

/// Formats `time` the way meta files store it.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parses a meta file time stamp.
pub fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    if text.len() != TIME_LENGTH {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(text, TIME_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Parses a time stamp from user input, for callers that accept
/// expiry times as strings.
pub fn parse_expiry(text: &str) -> Result<DateTime<Utc>> {
    parse_time(text.trim()).ok_or_else(|| CacheError::InvalidExpiry(text.to_string()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permission {
    pub dn: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaFile {
    pub url: String,
    pub validity: Option<DateTime<Utc>>,
    pub permissions: Vec<Permission>,
}

/// What we found at a meta file path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaState {
    Absent,
    /// The file exists, but has no owner URL.
    Malformed,
    Present(MetaFile),
}

/// Splits `"<head> <time>"`, if the last word is a valid time.
fn split_time(line: &str) -> Option<(&str, DateTime<Utc>)> {
    let (head, tail) = line.rsplit_once(' ')?;
    Some((head, parse_time(tail)?))
}

impl MetaFile {
    pub fn new(url: impl Into<String>) -> MetaFile {
        MetaFile {
            url: url.into(),
            validity: None,
            permissions: Vec::new(),
        }
    }

    /// Parses meta file contents.  Returns `None` if the first line
    /// is empty.  Unparsable permission records are dropped.
    pub fn parse(text: &str) -> Option<MetaFile> {
        let mut lines = text.lines();
        let first = lines.next()?.trim_end();
        if first.is_empty() {
            return None;
        }

        let (url, validity) = match split_time(first) {
            Some((url, validity)) if !url.is_empty() => (url, Some(validity)),
            _ => (first, None),
        };

        let permissions = lines
            .filter_map(|line| {
                let (dn, expiry) = split_time(line.trim_end())?;
                if dn.is_empty() {
                    return None;
                }

                Some(Permission {
                    dn: dn.to_string(),
                    expiry,
                })
            })
            .collect();

        Some(MetaFile {
            url: url.to_string(),
            validity,
            permissions,
        })
    }

    pub fn render(&self) -> String {
        let mut out = self.url.clone();
        if let Some(validity) = &self.validity {
            out.push(' ');
            out.push_str(&format_time(validity));
        }
        out.push('\n');

        for permission in &self.permissions {
            out.push_str(&permission.dn);
            out.push(' ');
            out.push_str(&format_time(&permission.expiry));
            out.push('\n');
        }

        out
    }

    /// Reads the meta file at `path`.
    pub fn load(path: &Path) -> Result<MetaState> {
        let contents = match absent_as_none(std::fs::read(path)).at(path)? {
            Some(contents) => contents,
            None => return Ok(MetaState::Absent),
        };

        Ok(match MetaFile::parse(&String::from_utf8_lossy(&contents)) {
            Some(meta) => MetaState::Present(meta),
            None => MetaState::Malformed,
        })
    }

    /// Atomically replaces the meta file at `path` with our contents.
    /// The result is only readable and writable by its owner.
    pub fn store(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).at(dir)?;

        tmp.write_all(self.render().as_bytes()).at(tmp.path())?;
        tmp.as_file().sync_data().at(tmp.path())?;
        tmp.persist(path).map_err(|e| CacheError::io(path, e.error))?;
        Ok(())
    }

    /// Records that `dn` may read the entry until `expiry`.  Replaces
    /// any previous record for `dn`, and drops other records that
    /// expired more than `grace` before `now`.
    pub fn grant(
        &mut self,
        dn: &str,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) {
        let horizon = now - grace;

        self.permissions
            .retain(|permission| permission.dn != dn && permission.expiry > horizon);
        self.permissions.push(Permission {
            dn: dn.to_string(),
            expiry,
        });
    }

    /// Returns whether `dn` holds a permission that is still valid
    /// at `now`.
    pub fn permits(&self, dn: &str, now: DateTime<Utc>) -> bool {
        self.permissions
            .iter()
            .any(|permission| permission.dn == dn && permission.expiry > now)
    }
}
