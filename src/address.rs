//! Cache entries are addressed by the lowercase hex SHA-1 of their
//! URL.  The hash is split into a few leading directory levels to
//! bound the fan-out of any single directory: with the default one
//! level of two characters, `8a929b8384300813ba1dd2d661c42835b80691a2`
//! lives at `8a/929b8384300813ba1dd2d661c42835b80691a2`.
//!
//! There is no collision resolution here.  Two URLs with the same
//! hash map to the same entry, and the meta file catches that.
use std::path::PathBuf;

/// Length of a hex-encoded SHA-1 digest.
pub const HASH_LENGTH: usize = 40;

pub const DEFAULT_LEVELS: usize = 1;
pub const DEFAULT_LENGTH: usize = 2;

/// Returns the lowercase hex SHA-1 of `url`.
pub fn hash_url(url: &str) -> String {
    hex::encode(extendhash::sha1::compute_hash(url.as_bytes()))
}

/// An `Addressor` maps URLs to relative paths under a cache's data
/// directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addressor {
    levels: usize,
    length: usize,
}

impl Default for Addressor {
    fn default() -> Self {
        Addressor {
            levels: DEFAULT_LEVELS,
            length: DEFAULT_LENGTH,
        }
    }
}

impl Addressor {
    /// Returns an addressor that splits hashes into `levels`
    /// directories of `length` characters each, or `None` if that
    /// would not leave any characters for the file name.
    pub fn new(levels: usize, length: usize) -> Option<Addressor> {
        if length == 0 && levels > 0 {
            return None;
        }

        if levels.checked_mul(length)? >= HASH_LENGTH {
            return None;
        }

        Some(Addressor { levels, length })
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns the relative path for `url`, or `None` for an empty
    /// URL: there is nothing meaningful to cache there.
    pub fn relative_path(&self, url: &str) -> Option<PathBuf> {
        if url.is_empty() {
            return None;
        }

        let hash = hash_url(url);
        let mut path = PathBuf::new();
        let mut rest = hash.as_str();
        for _ in 0..self.levels {
            let (dir, tail) = rest.split_at(self.length);
            path.push(dir);
            rest = tail;
        }

        path.push(rest);
        Some(path)
    }
}

#[test]
fn test_known_hash() {
    assert_eq!(
        hash_url("http://host.org/file1"),
        "8a929b8384300813ba1dd2d661c42835b80691a2"
    );
}

#[test]
fn test_default_split() {
    let path = Addressor::default()
        .relative_path("http://host.org/file1")
        .expect("url is not empty");

    assert_eq!(
        path,
        PathBuf::from("8a/929b8384300813ba1dd2d661c42835b80691a2")
    );
}

#[test]
fn test_deeper_split() {
    let path = Addressor::new(3, 2)
        .expect("layout is valid")
        .relative_path("http://host.org/file1")
        .expect("url is not empty");

    assert_eq!(
        path,
        PathBuf::from("8a/92/9b/8384300813ba1dd2d661c42835b80691a2")
    );
}

#[test]
fn test_flat() {
    let path = Addressor::new(0, 2)
        .expect("layout is valid")
        .relative_path("http://host.org/file1")
        .expect("url is not empty");

    assert_eq!(
        path,
        PathBuf::from("8a929b8384300813ba1dd2d661c42835b80691a2")
    );
}

#[test]
fn test_empty_url() {
    assert_eq!(Addressor::default().relative_path(""), None);
}

#[test]
fn test_bad_layouts() {
    assert_eq!(Addressor::new(20, 2), None);
    assert_eq!(Addressor::new(1, 40), None);
    assert_eq!(Addressor::new(2, 0), None);
    assert_eq!(Addressor::new(usize::MAX, 2), None);
    assert!(Addressor::new(19, 2).is_some());
}
