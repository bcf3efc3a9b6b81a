/// We expect some [`std::io::Error`] during regular operations:
/// the cache relies on the filesystem for concurrency control, and
/// other processes create and delete entries all the time.
use std::io::Error;
use std::io::ErrorKind;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're trying to read
/// isn't available on the server anymore, which is what another host
/// deleting a cache entry looks like from here.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Maps absent files to `Ok(None)`, and passes everything else
/// through.
pub fn absent_as_none<T>(result: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_absent_file_error(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes a file, succeeding if it is already gone.
pub fn ensure_file_removed(path: &std::path::Path) -> std::io::Result<()> {
    absent_as_none(std::fs::remove_file(path)).map(|_| ())
}

#[test]
fn test_getters() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));
}

#[test]
fn test_absent_as_none() {
    assert!(matches!(absent_as_none(Ok(3)), Ok(Some(3))));
    assert!(matches!(
        absent_as_none::<()>(Err(Error::from_raw_os_error(libc::ENOENT))),
        Ok(None)
    ));
    assert!(absent_as_none::<()>(Err(Error::from_raw_os_error(libc::EACCES))).is_err());
}

#[test]
fn test_ensure_file_removed() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("victim", FileType::ZeroFile(10));
    let path = temp.path("victim");

    ensure_file_removed(&path).expect("removal should succeed");
    assert!(std::fs::metadata(&path).is_err());
    // Removing a file that does not exist is ok.
    ensure_file_removed(&path).expect("second removal should succeed");
}
