// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Capacity registry
//!
//! Tracks how many transfers each source node, destination node and
//! destination path is currently serving. All counters live here and are
//! only changed through the reserve/release operations, each of which runs
//! in a single critical section. Callers never see the counters directly;
//! they get snapshot copies.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::error;

use crate::config::{MigrationConfig, NodeConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node address is empty")]
    EmptyAddress,

    #[error("node {0} is configured more than once")]
    DuplicateAddress(String),

    #[error("node {0} has zero bandwidth")]
    ZeroBandwidth(String),

    #[error("node {address} bandwidth {bandwidth_mbps} is below one transfer slot")]
    ZeroLimit { address: String, bandwidth_mbps: u32 },

    #[error("node {0} has no paths")]
    NoPaths(String),

    #[error("node {address} lists path {path} more than once")]
    DuplicatePath { address: String, path: PathBuf },

    #[error("node {address} path {path} has a limit of zero")]
    InvalidPathLimit { address: String, path: PathBuf },
}

#[derive(Debug)]
struct StoragePath {
    root: PathBuf,
    limit: u32,
    in_use: u32,
}

#[derive(Debug)]
struct StorageNode {
    paths: Vec<StoragePath>,
    limit: u32,
    in_use: u32,
}

impl StorageNode {
    fn from_config(config: &NodeConfig, single_thread_mbps: u32) -> Result<Self, RegistryError> {
        if config.address.is_empty() {
            return Err(RegistryError::EmptyAddress);
        }
        if config.bandwidth_mbps == 0 {
            return Err(RegistryError::ZeroBandwidth(config.address.clone()));
        }
        let limit = config.bandwidth_mbps / single_thread_mbps.max(1);
        if limit == 0 {
            return Err(RegistryError::ZeroLimit {
                address: config.address.clone(),
                bandwidth_mbps: config.bandwidth_mbps,
            });
        }
        if config.paths.is_empty() {
            return Err(RegistryError::NoPaths(config.address.clone()));
        }

        let mut seen = HashSet::new();
        let mut paths = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            if !seen.insert(&path.location) {
                return Err(RegistryError::DuplicatePath {
                    address: config.address.clone(),
                    path: path.location.clone(),
                });
            }
            let path_limit = path.limit.unwrap_or(limit);
            if path_limit == 0 {
                return Err(RegistryError::InvalidPathLimit {
                    address: config.address.clone(),
                    path: path.location.clone(),
                });
            }
            paths.push(StoragePath {
                root: path.location.clone(),
                limit: path_limit,
                in_use: 0,
            });
        }

        Ok(Self {
            paths,
            limit,
            in_use: 0,
        })
    }

    fn snapshot(&self, address: &str) -> NodeSnapshot {
        NodeSnapshot {
            address: address.to_string(),
            limit: self.limit,
            in_use: self.in_use,
            paths: self
                .paths
                .iter()
                .map(|p| PathSnapshot {
                    root: p.root.clone(),
                    limit: p.limit,
                    in_use: p.in_use,
                })
                .collect(),
        }
    }
}

type Side = Mutex<BTreeMap<String, StorageNode>>;

fn build_side(nodes: &[NodeConfig], single_thread_mbps: u32) -> Result<Side, RegistryError> {
    let mut map = BTreeMap::new();
    for config in nodes {
        let node = StorageNode::from_config(config, single_thread_mbps)?;
        if map.insert(config.address.clone(), node).is_some() {
            return Err(RegistryError::DuplicateAddress(config.address.clone()));
        }
    }
    Ok(Mutex::new(map))
}

/// Lock a side. Counters stay consistent even if a holder panicked, since
/// every critical section is a plain check-and-increment.
fn lock(side: &Side) -> MutexGuard<'_, BTreeMap<String, StorageNode>> {
    side.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Copy of one path's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSnapshot {
    pub root: PathBuf,
    pub limit: u32,
    pub in_use: u32,
}

impl PathSnapshot {
    pub fn has_capacity(&self) -> bool {
        self.in_use < self.limit
    }
}

/// Copy of one node's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub address: String,
    pub limit: u32,
    pub in_use: u32,
    pub paths: Vec<PathSnapshot>,
}

impl NodeSnapshot {
    pub fn spare(&self) -> u32 {
        self.limit.saturating_sub(self.in_use)
    }

    pub fn has_capacity(&self) -> bool {
        self.in_use < self.limit
    }
}

#[derive(Debug)]
pub struct CapacityRegistry {
    sources: Side,
    destinations: Side,
}

impl CapacityRegistry {
    pub fn from_config(config: &MigrationConfig) -> Result<Self, RegistryError> {
        Ok(Self {
            sources: build_side(&config.src_nodes, config.single_thread_mbps)?,
            destinations: build_side(&config.dst_nodes, config.single_thread_mbps)?,
        })
    }

    /// Take one source slot on `address` if the node is below its limit.
    pub fn reserve_source(&self, address: &str) -> bool {
        let mut nodes = lock(&self.sources);
        match nodes.get_mut(address) {
            Some(node) if node.in_use < node.limit => {
                node.in_use += 1;
                true
            }
            _ => false,
        }
    }

    pub fn release_source(&self, address: &str) {
        let mut nodes = lock(&self.sources);
        match nodes.get_mut(address) {
            Some(node) if node.in_use > 0 => node.in_use -= 1,
            Some(_) => error!(address, "source slot released more often than reserved"),
            None => error!(address, "release for unknown source node"),
        }
    }

    /// Take one slot on destination node `address` and its path
    /// `path_index`, only if both are below their limits.
    pub fn reserve_destination_path(&self, address: &str, path_index: usize) -> bool {
        let mut nodes = lock(&self.destinations);
        let Some(node) = nodes.get_mut(address) else {
            return false;
        };
        if node.in_use >= node.limit {
            return false;
        }
        let Some(path) = node.paths.get_mut(path_index) else {
            return false;
        };
        if path.in_use >= path.limit {
            return false;
        }
        path.in_use += 1;
        node.in_use += 1;
        true
    }

    pub fn release_destination_path(&self, address: &str, path_index: usize) {
        let mut nodes = lock(&self.destinations);
        let Some(node) = nodes.get_mut(address) else {
            error!(address, "release for unknown destination node");
            return;
        };
        match node.paths.get_mut(path_index) {
            Some(path) if path.in_use > 0 => path.in_use -= 1,
            Some(path) => error!(
                address,
                path = %path.root.display(),
                "destination path slot released more often than reserved"
            ),
            None => error!(address, path_index, "release for unknown destination path"),
        }
        if node.in_use > 0 {
            node.in_use -= 1;
        } else {
            error!(address, "destination slot released more often than reserved");
        }
    }

    pub fn source_snapshot(&self) -> Vec<NodeSnapshot> {
        lock(&self.sources)
            .iter()
            .map(|(address, node)| node.snapshot(address))
            .collect()
    }

    pub fn destination_snapshot(&self) -> Vec<NodeSnapshot> {
        lock(&self.destinations)
            .iter()
            .map(|(address, node)| node.snapshot(address))
            .collect()
    }

    /// Every destination root, in node then path order
    pub fn destination_roots(&self) -> Vec<(String, usize, PathBuf)> {
        lock(&self.destinations)
            .iter()
            .flat_map(|(address, node)| {
                node.paths
                    .iter()
                    .enumerate()
                    .map(move |(i, p)| (address.clone(), i, p.root.clone()))
            })
            .collect()
    }

    /// Storage roots configured for source node `address`
    pub fn source_roots(&self, address: &str) -> Vec<PathBuf> {
        lock(&self.sources)
            .get(address)
            .map(|node| node.paths.iter().map(|p| p.root.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether every counter on both sides is back at zero
    pub fn is_idle(&self) -> bool {
        let idle = |side: &Side| {
            lock(side)
                .values()
                .all(|n| n.in_use == 0 && n.paths.iter().all(|p| p.in_use == 0))
        };
        idle(&self.sources) && idle(&self.destinations)
    }
}

/// One source slot and one destination path slot held by a transfer.
///
/// Both are released exactly once, when the guard is dropped.
#[derive(Debug)]
pub struct Reservation {
    registry: Arc<CapacityRegistry>,
    source: String,
    destination: String,
    path_index: usize,
}

impl Reservation {
    /// Wrap slots that have already been reserved on `registry`.
    pub fn new(
        registry: Arc<CapacityRegistry>,
        source: impl Into<String>,
        destination: impl Into<String>,
        path_index: usize,
    ) -> Self {
        Self {
            registry,
            source: source.into(),
            destination: destination.into(),
            path_index,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path_index(&self) -> usize {
        self.path_index
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry
            .release_destination_path(&self.destination, self.path_index);
        self.registry.release_source(&self.source);
    }
}
