// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Transfer executor
//!
//! Copies the files of one unit from its source root to a destination root.
//! Every file is written to `<dest>.tmp`, synced, then renamed into place,
//! so a destination path either holds a complete copy or nothing at all.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::unit::TransferUnit;
use crate::verify::files_match;

/// Copy buffer size
pub const BUFFER_BYTES: usize = 1 << 20;

/// Rate limiting window
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer stopped")]
    Stopped,

    #[error("{path} is not a regular file")]
    NotRegularFile { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl TransferError {
    pub fn is_stopped(&self) -> bool {
        matches!(self, TransferError::Stopped)
    }

    /// Label used for the error metric
    pub fn error_type(&self) -> &'static str {
        match self {
            TransferError::Stopped => "stopped",
            TransferError::NotRegularFile { .. } => "not_regular_file",
            TransferError::Io { .. } => "io",
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> TransferError + '_ {
    move |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Moves one unit to a destination root.
///
/// Returns the number of bytes written. Implementations must leave no
/// partial file at a final destination path when they fail.
#[async_trait]
pub trait Transfer: Send + Sync + 'static {
    async fn transfer(&self, unit: &TransferUnit, dest_root: &Path) -> Result<u64, TransferError>;
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Per-transfer cap in bytes per second
    pub rate_limit: Option<u64>,
    /// Samples per file when checking whether a cache member is already
    /// present
    pub hash_chunks: u32,
}

/// Executor for locally mounted source and destination paths
pub struct FileTransfer {
    options: TransferOptions,
    stop: CancellationToken,
}

impl FileTransfer {
    pub fn new(options: TransferOptions, stop: CancellationToken) -> Self {
        Self { options, stop }
    }

    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, TransferError> {
        let meta = fs::metadata(src).await.map_err(io_err(src))?;
        if !meta.is_file() {
            return Err(TransferError::NotRegularFile {
                path: src.to_path_buf(),
            });
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let reader = File::open(src).await.map_err(io_err(src))?;
        write_atomically(reader, src, dst, self.options.rate_limit, &self.stop).await
    }

    async fn member_present(&self, src: &Path, dst: &Path) -> bool {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        let chunks = self.options.hash_chunks;
        tokio::task::spawn_blocking(move || files_match(&src, &dst, chunks))
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transfer for FileTransfer {
    async fn transfer(&self, unit: &TransferUnit, dest_root: &Path) -> Result<u64, TransferError> {
        if unit.kind.is_directory() {
            let dir = dest_root.join(unit.relative_root());
            fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        }

        let pairs: Vec<(PathBuf, PathBuf)> = unit.path_pairs(dest_root).collect();
        let mut copied = 0;
        for (src, dst) in pairs {
            if self.stop.is_cancelled() {
                return Err(TransferError::Stopped);
            }
            // Cache members are independent; ones finished by an earlier
            // attempt are kept.
            if unit.kind.is_directory() && self.member_present(&src, &dst).await {
                debug!(unit = %unit, dst = %dst.display(), "member already present");
                continue;
            }
            copied += self.copy_file(&src, &dst).await?;
        }
        Ok(copied)
    }
}

/// `<path>.tmp`
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Stream `reader` into `dst` through a temporary file.
///
/// `src` only labels read errors. On any failure, including a stop request,
/// the temporary file is removed and `dst` is left untouched.
pub async fn write_atomically<R: AsyncRead + Unpin>(
    mut reader: R,
    src: &Path,
    dst: &Path,
    rate_limit: Option<u64>,
    stop: &CancellationToken,
) -> Result<u64, TransferError> {
    let tmp = tmp_path(dst);
    let result = match copy_into(&mut reader, src, &tmp, rate_limit, stop).await {
        Ok(written) => fs::rename(&tmp, dst)
            .await
            .map(|()| written)
            .map_err(io_err(dst)),
        Err(e) => Err(e),
    };

    if result.is_err()
        && let Err(e) = fs::remove_file(&tmp).await
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %tmp.display(), error = %e, "failed to remove temporary file");
    }
    result
}

async fn copy_into<R: AsyncRead + Unpin>(
    reader: &mut R,
    src: &Path,
    tmp: &Path,
    rate_limit: Option<u64>,
    stop: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut file = File::create(tmp).await.map_err(io_err(tmp))?;
    let mut buf = vec![0u8; BUFFER_BYTES];
    let mut limiter = rate_limit.map(RateLimiter::new);
    let mut written = 0u64;

    loop {
        if stop.is_cancelled() {
            return Err(TransferError::Stopped);
        }
        let n = reader.read(&mut buf).await.map_err(io_err(src))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await.map_err(io_err(tmp))?;
        written += n as u64;
        if let Some(limiter) = limiter.as_mut() {
            limiter.consume(n as u64).await;
        }
    }

    file.flush().await.map_err(io_err(tmp))?;
    file.sync_all().await.map_err(io_err(tmp))?;
    Ok(written)
}

/// Keeps a stream at or below a byte budget per one-second window.
///
/// Bytes beyond the budget carry over into the next window.
#[derive(Debug)]
pub struct RateLimiter {
    budget: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            budget: bytes_per_sec.max(1),
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Account for `bytes` just written, sleeping while the current window
    /// is over budget.
    pub async fn consume(&mut self, bytes: u64) {
        if self.window_start.elapsed() >= WINDOW {
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        self.window_bytes += bytes;
        while self.window_bytes > self.budget {
            tokio::time::sleep_until(self.window_start + WINDOW).await;
            self.window_start += WINDOW;
            self.window_bytes -= self.budget;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{materialize, unit, write_file};
    use crate::unit::UnitKind;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Yields `remaining` bytes, then fails
    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::other("device went away")));
            }
            let n = self.remaining.min(buf.remaining()).min(1000);
            buf.put_slice(&vec![7u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    fn executor(stop: CancellationToken) -> FileTransfer {
        FileTransfer::new(
            TransferOptions {
                rate_limit: None,
                hash_chunks: 3,
            },
            stop,
        )
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/mnt/dst/sealed/s-1")),
            PathBuf::from("/mnt/dst/sealed/s-1.tmp")
        );
    }

    #[tokio::test]
    async fn write_atomically_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        let data = vec![3u8; 3 * BUFFER_BYTES + 17];

        let written = write_atomically(
            data.as_slice(),
            Path::new("mem"),
            &dst,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
        assert!(!tmp_path(&dst).exists());
    }

    #[tokio::test]
    async fn failed_read_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");

        let err = write_atomically(
            FailingReader { remaining: 5000 },
            Path::new("src"),
            &dst,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Io { ref path, .. } if path == Path::new("src")));
        assert!(!dst.exists());
        assert!(!tmp_path(&dst).exists());
    }

    #[tokio::test]
    async fn failed_write_keeps_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        std::fs::write(&dst, b"previous").unwrap();

        write_atomically(
            FailingReader { remaining: 10 },
            Path::new("src"),
            &dst,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(std::fs::read(&dst).unwrap(), b"previous");
        assert!(!tmp_path(&dst).exists());
    }

    #[tokio::test]
    async fn stop_aborts_before_any_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let u = unit("s-1", UnitKind::Primary, "s1", &src, 64 << 10);
        materialize(&u, 1);

        let stop = CancellationToken::new();
        stop.cancel();
        let err = executor(stop).transfer(&u, &dst).await.unwrap_err();

        assert!(err.is_stopped());
        assert!(!dst.join("sealed/s-1").exists());
        assert!(!dst.join("sealed/s-1.tmp").exists());
    }

    #[tokio::test]
    async fn single_file_unit_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let u = unit("s-1", UnitKind::Secondary, "s1", &src, 64 << 10);
        materialize(&u, 4);

        let written = executor(CancellationToken::new())
            .transfer(&u, &dst)
            .await
            .unwrap();

        assert_eq!(written, 64 << 10);
        assert_eq!(
            std::fs::read(src.join("unsealed/s-1")).unwrap(),
            std::fs::read(dst.join("unsealed/s-1")).unwrap()
        );
    }

    #[tokio::test]
    async fn directory_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(src.join("sealed/s-1")).unwrap();
        let u = unit("s-1", UnitKind::Primary, "s1", &src, 0);

        let err = executor(CancellationToken::new())
            .transfer(&u, &dst)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotRegularFile { .. }));
        assert_eq!(err.error_type(), "not_regular_file");
    }

    #[tokio::test]
    async fn cache_transfer_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let u = unit("s-1", UnitKind::Auxiliary, "s1", &src, 0);
        materialize(&u, 2);
        // stray files in the source cache dir are not part of the unit
        write_file(&src.join("cache/s-1/stray.log"), 5, 0);

        // first tree file already landed in an earlier attempt
        let done = &u.files[2];
        std::fs::create_dir_all(dst.join(done).parent().unwrap()).unwrap();
        std::fs::copy(src.join(done), dst.join(done)).unwrap();

        let written = executor(CancellationToken::new())
            .transfer(&u, &dst)
            .await
            .unwrap();

        assert_eq!(written, 64 + 64 + 4096);
        for file in &u.files {
            assert_eq!(
                std::fs::read(src.join(file)).unwrap(),
                std::fs::read(dst.join(file)).unwrap()
            );
        }
        assert!(!dst.join("cache/s-1/stray.log").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spreads_bytes_over_windows() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(1 << 20);

        limiter.consume(1 << 20).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.consume(1 << 20).await;
        limiter.consume(1 << 20).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_idle_window_resets() {
        let mut limiter = RateLimiter::new(1000);
        limiter.consume(900).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.consume(900).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
