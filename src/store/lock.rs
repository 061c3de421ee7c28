use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::Result;

/// Take an exclusive lock on `path`, creating the file if needed.
///
/// A lock held elsewhere is `Ok(None)`; any other failure is an error. The
/// lock lasts as long as the returned `File`.
pub fn try_acquire_lock(path: &Path) -> Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if is_contended(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_sees_lock_as_taken() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("tab.lock");

        let file = try_acquire_lock(&lock_path).unwrap().unwrap();
        assert!(try_acquire_lock(&lock_path).unwrap().is_none());

        drop(file);
        assert!(try_acquire_lock(&lock_path).unwrap().is_some());
    }

    #[test]
    fn only_contention_counts_as_held() {
        assert!(is_contended(&fs2::lock_contended_error()));
        assert!(!is_contended(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_contended(&io::Error::other("disk gone")));
    }

    #[test]
    fn unusable_lock_path_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("no-such-dir").join("tab.lock");
        assert!(try_acquire_lock(&missing).is_err());
    }
}
