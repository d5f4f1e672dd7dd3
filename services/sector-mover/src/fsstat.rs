// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Filesystem statistics
//!
//! Free-space lookups go through [`SpaceProbe`] so placement can be tested
//! without real filesystems of the right size.

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Setting this to `1` disables [`check_disk_size`]
pub const SKIP_CHECK_ENV: &str = "SKIP_CHECK_DISK_SIZE";

const GIB: f64 = (1u64 << 30) as f64;

/// Capacity of the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// Bytes an unprivileged writer can still use
    pub available: u64,
    /// Size of the filesystem
    pub total: u64,
}

pub trait SpaceProbe: Send + Sync + 'static {
    fn stats(&self, path: &Path) -> io::Result<FsStats>;

    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        Ok(self.stats(path)?.available)
    }
}

/// Production probe backed by `statvfs(3)`
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn stats(&self, path: &Path) -> io::Result<FsStats> {
        statvfs(path)
    }
}

#[allow(clippy::unnecessary_cast)]
pub fn statvfs(path: &Path) -> io::Result<FsStats> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::zeroed();

    // SAFETY: c_path is NUL terminated and stat points to writable memory
    // large enough for a statvfs struct.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs returned success, so the struct is initialised.
    let stat = unsafe { stat.assume_init() };

    let frsize = stat.f_frsize as u64;
    Ok(FsStats {
        available: (stat.f_bavail as u64).saturating_mul(frsize),
        total: (stat.f_blocks as u64).saturating_mul(frsize),
    })
}

#[derive(Debug, Error)]
pub enum DiskCheckError {
    #[error("stat of {path} did not finish within {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("failed to stat {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("{path} holds {total} bytes, {required} required")]
    TooSmall {
        path: PathBuf,
        total: u64,
        required: u64,
    },

    #[error("disk check task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Check that the filesystem at `path` is reachable and at least `required`
/// bytes large.
///
/// The stat runs on the blocking pool so a hung mount cannot stall the
/// runtime; it is abandoned after `timeout`. Returns `None` when the check
/// is disabled through [`SKIP_CHECK_ENV`].
pub async fn check_disk_size<P: SpaceProbe>(
    probe: Arc<P>,
    path: &Path,
    required: u64,
    timeout: Duration,
) -> Result<Option<FsStats>, DiskCheckError> {
    if std::env::var(SKIP_CHECK_ENV).is_ok_and(|v| v == "1") {
        debug!(path = %path.display(), "disk size check skipped");
        return Ok(None);
    }

    let owned = path.to_path_buf();
    let task = tokio::task::spawn_blocking(move || probe.stats(&owned));
    let stats = match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined?.map_err(|source| DiskCheckError::Stat {
            path: path.to_path_buf(),
            source,
        })?,
        Err(_) => {
            warn!(path = %path.display(), ?timeout, "disk size check timed out");
            return Err(DiskCheckError::Timeout {
                path: path.to_path_buf(),
                timeout,
            });
        }
    };

    if stats.total < required {
        warn!(
            path = %path.display(),
            required_gib = required as f64 / GIB,
            total_gib = stats.total as f64 / GIB,
            "filesystem smaller than required"
        );
        return Err(DiskCheckError::TooSmall {
            path: path.to_path_buf(),
            total: stats.total,
            required,
        });
    }

    Ok(Some(stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowProbe;

    impl SpaceProbe for SlowProbe {
        fn stats(&self, _path: &Path) -> io::Result<FsStats> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(FsStats {
                available: 1,
                total: 1,
            })
        }
    }

    #[test]
    fn statvfs_reports_space_for_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let stats = statvfs(dir.path()).unwrap();
        assert!(stats.total > 0);
        assert!(stats.available <= stats.total);
    }

    #[test]
    fn statvfs_fails_for_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(statvfs(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn disk_check_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(StatvfsProbe);

        let stats = check_disk_size(Arc::clone(&probe), dir.path(), 1, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(stats.total >= 1);

        let err = check_disk_size(
            Arc::clone(&probe),
            dir.path(),
            u64::MAX,
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiskCheckError::TooSmall { .. }));

        let err = check_disk_size(
            Arc::clone(&probe),
            &dir.path().join("missing"),
            0,
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiskCheckError::Stat { .. }));

        let err = check_disk_size(
            Arc::new(SlowProbe),
            dir.path(),
            0,
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiskCheckError::Timeout { .. }));
    }
}
