// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Builders shared by the unit tests

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{MigrationConfig, NodeConfig, PathConfig};
use crate::fsstat::{FsStats, SpaceProbe};
use crate::unit::{Geometry, SizeClass, TransferUnit, UnitKind};

/// Tiny artifacts: 64 KiB / 128 KiB sectors, cache dirs of 2 or 4 tree files
pub fn small_geometry() -> Geometry {
    Geometry {
        sector_bytes_32g: 64 << 10,
        sector_bytes_64g: 128 << 10,
        tree_r_bytes: 4096,
        tree_r_count_32g: 2,
        tree_r_count_64g: 4,
        aux_member_bytes: 64,
        tolerance: 16,
    }
}

pub fn node(address: &str, bandwidth_mbps: u32, paths: &[(&Path, Option<u32>)]) -> NodeConfig {
    NodeConfig {
        address: address.to_string(),
        bandwidth_mbps,
        paths: paths
            .iter()
            .map(|(location, limit)| PathConfig {
                location: location.to_path_buf(),
                limit: *limit,
            })
            .collect(),
    }
}

/// Config with a single-thread rate of 100, so a node's limit is its
/// bandwidth divided by 100
pub fn config(src_nodes: Vec<NodeConfig>, dst_nodes: Vec<NodeConfig>) -> MigrationConfig {
    let mut config =
        MigrationConfig::from_yaml("src_nodes: []\ndst_nodes: []\nsingle_thread_mbps: 100\n")
            .unwrap();
    config.src_nodes = src_nodes;
    config.dst_nodes = dst_nodes;
    config.geometry = small_geometry();
    config.hash_chunks = 3;
    config
}

/// Unit whose files are expected at their standard location under `root`
pub fn unit(id: &str, kind: UnitKind, source: &str, root: &Path, bytes: u64) -> TransferUnit {
    let geometry = small_geometry();
    let files = kind
        .manifest(id, SizeClass::Gib32, &geometry)
        .into_iter()
        .map(|m| m.relative)
        .collect();
    TransferUnit::new(id, kind, source, root, SizeClass::Gib32, files, bytes)
}

/// Write `len` bytes of a pattern derived from `seed`
pub fn write_file(path: &Path, len: u64, seed: u8) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let data: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    std::fs::write(path, data).unwrap();
}

/// Write every manifest file of `unit` under its source root
pub fn materialize(unit: &TransferUnit, seed: u8) {
    let geometry = small_geometry();
    for entry in unit.kind.manifest(&unit.id, unit.size_class, &geometry) {
        write_file(
            &unit.source_root.join(&entry.relative),
            entry.expected_bytes,
            seed,
        );
    }
}

/// Probe reporting fixed free space per root; unknown roots fail
#[derive(Debug, Default)]
pub struct FixedSpace {
    available: HashMap<PathBuf, u64>,
}

impl FixedSpace {
    pub fn with(mut self, root: &Path, available: u64) -> Self {
        self.available.insert(root.to_path_buf(), available);
        self
    }
}

impl SpaceProbe for FixedSpace {
    fn stats(&self, path: &Path) -> io::Result<FsStats> {
        self.available
            .get(path)
            .map(|&available| FsStats {
                available,
                total: available,
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown root"))
    }
}
