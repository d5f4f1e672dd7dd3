// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Single-instance lock
//!
//! Two migrations on one host would each believe they own every transfer
//! slot. The lock is an advisory `flock` on a well-known file, held for the
//! life of the process.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance holds {0}")]
    Held(PathBuf),

    #[error("failed to lock {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Held lock; released when dropped
#[derive(Debug)]
pub struct InstanceLock {
    // Closing the descriptor drops the flock.
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        // SAFETY: the descriptor is valid for as long as `file` lives.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(LockError::Held(path.to_path_buf()));
            }
            return Err(io_err(err));
        }

        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/sector-mover.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());

        // flock locks belong to the open file description, so a second
        // open in the same process conflicts like another process would.
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held(_)));

        drop(first);
        InstanceLock::acquire(&path).unwrap();
    }
}
