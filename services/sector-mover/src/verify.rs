// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Idempotence check
//!
//! Sector files are far too large to hash in full before every run, so
//! equality is judged on size plus an MD5 over evenly spaced samples. These
//! functions block; callers run them on the blocking pool.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use md5::{Digest, Md5};

use crate::unit::TransferUnit;

/// Length of each sample
pub const SAMPLE_BYTES: u64 = 4096;

/// Base64 MD5 over `size` and `chunks` evenly spaced samples plus the final
/// [`SAMPLE_BYTES`] of the file. Files no larger than the total sample
/// budget are hashed whole.
pub fn sampled_digest(path: &Path, size: u64, chunks: u32) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    hasher.update(size.to_le_bytes());

    let chunks = u64::from(chunks.max(1));
    let budget = SAMPLE_BYTES * (chunks + 1);

    if size <= budget {
        let mut whole = Vec::with_capacity(size as usize);
        file.by_ref().take(size).read_to_end(&mut whole)?;
        if (whole.len() as u64) < size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} is shorter than {} bytes", path.display(), size),
            ));
        }
        hasher.update(&whole);
    } else {
        let stride = size / chunks;
        let mut sample = vec![0u8; SAMPLE_BYTES as usize];
        let offsets = (0..chunks)
            .map(|i| i * stride)
            .chain(std::iter::once(size - SAMPLE_BYTES));
        for offset in offsets {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut sample)?;
            hasher.update(&sample);
        }
    }

    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        hasher.finalize(),
    ))
}

/// Whether `dst` holds the same content as `src`, judged by size and
/// sampled digest. Anything that cannot be read counts as a mismatch.
pub fn files_match(src: &Path, dst: &Path, chunks: u32) -> bool {
    let (Ok(src_meta), Ok(dst_meta)) = (std::fs::metadata(src), std::fs::metadata(dst)) else {
        return false;
    };
    if !src_meta.is_file() || !dst_meta.is_file() || src_meta.len() != dst_meta.len() {
        return false;
    }

    let size = src_meta.len();
    match (
        sampled_digest(src, size, chunks),
        sampled_digest(dst, size, chunks),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Whether every file of `unit` is already present under `root`.
pub fn already_at(unit: &TransferUnit, root: &Path, chunks: u32) -> bool {
    !unit.files.is_empty()
        && unit
            .path_pairs(root)
            .all(|(src, dst)| files_match(&src, &dst, chunks))
}
