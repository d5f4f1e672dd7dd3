// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Unit discovery
//!
//! Walks the source roots, classifies every candidate and builds the task
//! list. A second pass checks each unit against every destination root on
//! a bounded worker pool and marks the ones already present as done.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::classify::{
    ClassifyError, ManifestMember, classify_file, classify_manifest, verify_manifest,
};
use crate::config::MigrationConfig;
use crate::metrics;
use crate::unit::{TransferUnit, UnitKind, UnitStatus};
use crate::verify::already_at;

/// Suffix of partially written files
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid unit at {path}: {source}")]
    Invalid {
        path: PathBuf,
        source: ClassifyError,
    },

    #[error("{path} is not a {expected}")]
    UnexpectedEntry {
        path: PathBuf,
        expected: &'static str,
    },

    #[error("idempotence worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DiscoveryError {
    /// Errors that describe a bad unit rather than an unreadable tree
    fn is_unit_problem(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Invalid { .. } | DiscoveryError::UnexpectedEntry { .. }
        )
    }
}

/// Build the unit list from every configured source root.
///
/// Units are found under `<root>/sealed`, `<root>/cache` and
/// `<root>/unsealed` for the selected kinds. A kind directory that does not
/// exist is skipped. When the same ID and kind appear under more than one
/// root, the first one found wins.
pub fn scan_sources(config: &MigrationConfig) -> Result<Vec<TransferUnit>, DiscoveryError> {
    let mut units = Vec::new();
    let mut seen: HashSet<(String, UnitKind)> = HashSet::new();

    for node in &config.src_nodes {
        for path in &node.paths {
            for kind in UnitKind::ALL.into_iter().filter(|k| config.wants(*k)) {
                for unit in scan_kind(config, &node.address, &path.location, kind)? {
                    if seen.insert((unit.id.clone(), kind)) {
                        units.push(unit);
                    } else {
                        warn!(
                            unit = %unit,
                            root = %unit.source_root.display(),
                            "duplicate unit ignored"
                        );
                    }
                }
            }
        }
    }

    info!(units = units.len(), "source scan finished");
    Ok(units)
}

fn scan_kind(
    config: &MigrationConfig,
    address: &str,
    root: &Path,
    kind: UnitKind,
) -> Result<Vec<TransferUnit>, DiscoveryError> {
    let dir = root.join(kind.dir_name());
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "no {} directory", kind);
        return Ok(Vec::new());
    }

    let mut names = list_names(&dir)?;
    names.sort();

    let mut units = Vec::new();
    for name in names {
        if name.ends_with(TMP_SUFFIX) {
            continue;
        }
        match classify_entry(config, address, root, kind, &name) {
            Ok(unit) => units.push(unit),
            Err(e) if e.is_unit_problem() && config.skip_invalid_units => {
                warn!(error = %e, "skipping invalid unit");
                metrics::record_unit_invalid();
            }
            Err(e) => return Err(e),
        }
    }
    Ok(units)
}

fn list_names(dir: &Path) -> Result<Vec<String>, DiscoveryError> {
    let read_err = |source| DiscoveryError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => warn!(dir = %dir.display(), name = ?raw, "skipping non UTF-8 entry"),
        }
    }
    Ok(names)
}

fn classify_entry(
    config: &MigrationConfig,
    address: &str,
    root: &Path,
    kind: UnitKind,
    id: &str,
) -> Result<TransferUnit, DiscoveryError> {
    let path = root.join(kind.relative_root(id));
    let meta = std::fs::metadata(&path).map_err(|source| DiscoveryError::Read {
        path: path.clone(),
        source,
    })?;
    let geometry = &config.geometry;

    if !kind.is_directory() {
        if !meta.is_file() {
            return Err(DiscoveryError::UnexpectedEntry {
                path,
                expected: "regular file",
            });
        }
        let size = meta.len();
        let class = classify_file(size, geometry)
            .map_err(|source| DiscoveryError::Invalid { path, source })?;
        return Ok(TransferUnit::new(
            id,
            kind,
            address,
            root,
            class,
            vec![kind.relative_root(id)],
            size,
        ));
    }

    if !meta.is_dir() {
        return Err(DiscoveryError::UnexpectedEntry {
            path,
            expected: "directory",
        });
    }

    let members = read_members(&path)?;
    let class = classify_manifest(&members, geometry).map_err(|source| {
        DiscoveryError::Invalid {
            path: path.clone(),
            source,
        }
    })?;
    verify_manifest(class, &members, geometry).map_err(|source| DiscoveryError::Invalid {
        path: path.clone(),
        source,
    })?;

    // Only manifest members move; anything else in the directory stays.
    let manifest = kind.manifest(id, class, geometry);
    let files: Vec<PathBuf> = manifest.iter().map(|m| m.relative.clone()).collect();
    let bytes = manifest
        .iter()
        .filter_map(|m| {
            let name = m.relative.file_name()?.to_str()?;
            members.iter().find(|member| member.name == name)
        })
        .map(|member| member.size)
        .sum();

    Ok(TransferUnit::new(id, kind, address, root, class, files, bytes))
}

/// Regular files directly inside a cache directory
fn read_members(dir: &Path) -> Result<Vec<ManifestMember>, DiscoveryError> {
    let mut members = Vec::new();
    for name in list_names(dir)? {
        let path = dir.join(&name);
        let meta = std::fs::metadata(&path).map_err(|source| DiscoveryError::Read {
            path: path.clone(),
            source,
        })?;
        if meta.is_file() {
            members.push(ManifestMember::new(name, meta.len()));
        }
    }
    Ok(members)
}

/// Mark every unit already present on some destination root as done.
///
/// Each unit is checked on the blocking pool, with at most `workers`
/// checks in flight. Returns how many units were marked.
pub async fn mark_present(
    units: &mut [TransferUnit],
    roots: Vec<(String, PathBuf)>,
    chunks: u32,
    workers: usize,
) -> Result<usize, DiscoveryError> {
    let roots = Arc::new(roots);
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks: JoinSet<Option<(usize, String, PathBuf)>> = JoinSet::new();

    for (index, unit) in units.iter().enumerate() {
        if unit.status != UnitStatus::Waiting {
            continue;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let roots = Arc::clone(&roots);
        let unit = unit.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            roots
                .iter()
                .find(|(_, root)| already_at(&unit, root, chunks))
                .map(|(node, root)| (index, node.clone(), root.clone()))
        });
    }

    let mut marked = 0;
    while let Some(result) = tasks.join_next().await {
        if let Some((index, node, root)) = result? {
            let unit = &mut units[index];
            debug!(unit = %unit, node = %node, root = %root.display(), "already present");
            unit.set_destination(node, root);
            unit.status = UnitStatus::Done;
            metrics::record_unit_already_present();
            marked += 1;
        }
    }

    info!(marked, "idempotence check finished");
    Ok(marked)
}
