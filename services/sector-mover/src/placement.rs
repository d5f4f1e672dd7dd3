// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Placement engine
//!
//! Chooses a destination path for a unit and reserves a slot on it.
//!
//! Components of one sector belong together, so a unit whose sibling (the
//! same ID under another kind's directory) already sits on some destination
//! path, or is being copied to one, is sent there or nowhere. Units without
//! a placed sibling go to the least loaded node, and within it to the path
//! with the most free space per running transfer.
//!
//! Decisions are made against a snapshot of the registry; the only step
//! that touches shared counters is the final atomic reservation, and a lost
//! race simply moves on to the next candidate. Free-space probes and sibling
//! lookups happen outside the registry lock.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::fsstat::SpaceProbe;
use crate::registry::{CapacityRegistry, NodeSnapshot};
use crate::unit::{TransferUnit, UnitKind};

/// A reserved destination path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node: String,
    pub path_index: usize,
    pub root: PathBuf,
}

/// A component of the same sector placed earlier in this run, either still
/// copying or finished. Its files may not be visible under their final
/// names yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedSibling {
    pub kind: UnitKind,
    pub node: String,
    pub root: PathBuf,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("sibling found on {node} at {root} but that path is busy")]
    AffinityBusy { node: String, root: PathBuf },

    #[error("sibling found on {node} at {root} but its free space cannot be read: {reason}")]
    AffinityUnreadable {
        node: String,
        root: PathBuf,
        reason: String,
    },

    #[error("sibling found on {node} at {root} with {available} bytes free, {needed} needed")]
    AffinityNoSpace {
        node: String,
        root: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("no destination path can take {needed} bytes right now")]
    NoDestinationAvailable { needed: u64 },
}

pub struct PlacementEngine<P: SpaceProbe> {
    registry: Arc<CapacityRegistry>,
    probe: Arc<P>,
}

impl<P: SpaceProbe> PlacementEngine<P> {
    pub fn new(registry: Arc<CapacityRegistry>, probe: Arc<P>) -> Self {
        Self { registry, probe }
    }

    /// Pick a destination for `unit` and reserve one slot on it.
    ///
    /// `placed` lists siblings already given a destination in this run;
    /// other siblings are looked for on disk.
    ///
    /// On success the caller owns the destination slot. On error nothing
    /// is left reserved.
    pub fn place(
        &self,
        unit: &TransferUnit,
        placed: &[PlacedSibling],
    ) -> Result<Placement, PlacementError> {
        let nodes = self.registry.destination_snapshot();

        if !unit.affinity_blocked
            && let Some((node, path_index)) = find_sibling(unit, placed, &nodes)
        {
            return self.place_with_sibling(unit, node, path_index);
        }

        self.place_fresh(unit, &nodes)
    }

    fn place_with_sibling(
        &self,
        unit: &TransferUnit,
        node: &NodeSnapshot,
        path_index: usize,
    ) -> Result<Placement, PlacementError> {
        let path = &node.paths[path_index];
        let busy = || PlacementError::AffinityBusy {
            node: node.address.clone(),
            root: path.root.clone(),
        };

        let available = self
            .probe
            .available_bytes(&path.root)
            .map_err(|e| PlacementError::AffinityUnreadable {
                node: node.address.clone(),
                root: path.root.clone(),
                reason: e.to_string(),
            })?;

        if available < unit.total_bytes {
            return Err(PlacementError::AffinityNoSpace {
                node: node.address.clone(),
                root: path.root.clone(),
                needed: unit.total_bytes,
                available,
            });
        }

        if !node.has_capacity()
            || !path.has_capacity()
            || !self
                .registry
                .reserve_destination_path(&node.address, path_index)
        {
            return Err(busy());
        }

        debug!(
            unit = %unit,
            node = %node.address,
            root = %path.root.display(),
            "placed next to sibling"
        );
        Ok(Placement {
            node: node.address.clone(),
            path_index,
            root: path.root.clone(),
        })
    }

    fn place_fresh(
        &self,
        unit: &TransferUnit,
        nodes: &[NodeSnapshot],
    ) -> Result<Placement, PlacementError> {
        let mut candidates: Vec<&NodeSnapshot> =
            nodes.iter().filter(|n| n.has_capacity()).collect();
        // Stable sort keeps address order among equally loaded nodes.
        candidates.sort_by(|a, b| b.spare().cmp(&a.spare()));

        for node in candidates {
            let mut paths: Vec<(usize, u64)> = Vec::with_capacity(node.paths.len());
            for (index, path) in node.paths.iter().enumerate() {
                if !path.has_capacity() {
                    continue;
                }
                let available = match self.probe.available_bytes(&path.root) {
                    Ok(available) => available,
                    Err(e) => {
                        warn!(
                            node = %node.address,
                            root = %path.root.display(),
                            error = %e,
                            "failed to read free space, skipping path"
                        );
                        continue;
                    }
                };
                if available < unit.total_bytes {
                    continue;
                }
                paths.push((index, available / (1 + u64::from(path.in_use))));
            }
            paths.sort_by(|a, b| b.1.cmp(&a.1));

            for (index, _) in paths {
                if self.registry.reserve_destination_path(&node.address, index) {
                    let root = node.paths[index].root.clone();
                    debug!(
                        unit = %unit,
                        node = %node.address,
                        root = %root.display(),
                        "placed on fresh path"
                    );
                    return Ok(Placement {
                        node: node.address.clone(),
                        path_index: index,
                        root,
                    });
                }
            }
        }

        Err(PlacementError::NoDestinationAvailable {
            needed: unit.total_bytes,
        })
    }
}

/// First destination path holding a sibling of `unit`, checking sibling
/// kinds in priority order. For each kind a placement made in this run wins
/// over a copy found on disk.
fn find_sibling<'a>(
    unit: &TransferUnit,
    placed: &[PlacedSibling],
    nodes: &'a [NodeSnapshot],
) -> Option<(&'a NodeSnapshot, usize)> {
    for sibling in unit.kind.affinity_siblings() {
        let known = placed.iter().filter(|p| p.kind == sibling).find_map(|p| {
            let node = nodes.iter().find(|n| n.address == p.node)?;
            let index = node.paths.iter().position(|path| path.root == p.root)?;
            Some((node, index))
        });
        if known.is_some() {
            return known;
        }
        for node in nodes {
            for (index, path) in node.paths.iter().enumerate() {
                if unit.sibling_path(&path.root, sibling).exists() {
                    return Some((node, index));
                }
            }
        }
    }
    None
}
