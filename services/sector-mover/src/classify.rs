// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Unit classification
//!
//! Decides which size class a candidate unit belongs to. Sizes are gathered
//! by discovery; nothing here touches the filesystem.

use thiserror::Error;

use crate::unit::{Geometry, P_AUX, SizeClass, T_AUX, TREE_R_PREFIX, TREE_R_SUFFIX, tree_r_name};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("size {size} does not match any sector size class")]
    SizeOutOfClass { size: u64 },

    #[error("manifest member {member} is missing")]
    MemberMissing { member: String },

    #[error("manifest member {member} is empty")]
    MemberEmpty { member: String },

    #[error("manifest member {member} has size {size}, expected {expected}")]
    MemberSize {
        member: String,
        size: u64,
        expected: u64,
    },
}

/// A regular file found inside a cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMember {
    pub name: String,
    pub size: u64,
}

impl ManifestMember {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// Classify a sealed or unsealed file by its size.
pub fn classify_file(size: u64, geometry: &Geometry) -> Result<SizeClass, ClassifyError> {
    SizeClass::ALL
        .into_iter()
        .find(|class| size.abs_diff(geometry.sector_bytes(*class)) <= geometry.tolerance)
        .ok_or(ClassifyError::SizeOutOfClass { size })
}

/// Classify a cache directory by the summed size of its manifest members.
pub fn classify_manifest_total(total: u64, geometry: &Geometry) -> Result<SizeClass, ClassifyError> {
    SizeClass::ALL
        .into_iter()
        .find(|class| {
            total.abs_diff(geometry.manifest_total(*class)) <= geometry.manifest_tolerance(*class)
        })
        .ok_or(ClassifyError::SizeOutOfClass { size: total })
}

/// Whether `name` belongs to the cache manifest of any size class
pub fn is_manifest_member(name: &str, geometry: &Geometry) -> bool {
    if name == T_AUX || name == P_AUX {
        return true;
    }
    let max_trees = SizeClass::ALL
        .into_iter()
        .map(|class| geometry.tree_r_count(class))
        .max()
        .unwrap_or(0);
    name.strip_prefix(TREE_R_PREFIX)
        .and_then(|rest| rest.strip_suffix(TREE_R_SUFFIX))
        .and_then(|index| index.parse::<u32>().ok())
        .is_some_and(|index| index < max_trees && tree_r_name(index) == name)
}

/// Classify a cache directory from the files found in it. Files outside
/// every manifest do not count towards the total.
pub fn classify_manifest(
    members: &[ManifestMember],
    geometry: &Geometry,
) -> Result<SizeClass, ClassifyError> {
    let total = members
        .iter()
        .filter(|m| is_manifest_member(&m.name, geometry))
        .map(|m| m.size)
        .fold(0u64, u64::saturating_add);
    classify_manifest_total(total, geometry)
}

/// Check that a cache directory holds every expected member at a plausible
/// size. Extra files are ignored; they are not part of the manifest and are
/// never transferred.
pub fn verify_manifest(
    class: SizeClass,
    members: &[ManifestMember],
    geometry: &Geometry,
) -> Result<(), ClassifyError> {
    let expected = [T_AUX.to_string(), P_AUX.to_string()]
        .into_iter()
        .map(|name| (name, geometry.aux_member_bytes))
        .chain((0..geometry.tree_r_count(class)).map(|i| (tree_r_name(i), geometry.tree_r_bytes)));

    for (name, expected_bytes) in expected {
        let member = members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ClassifyError::MemberMissing {
                member: name.clone(),
            })?;

        if member.size == 0 {
            return Err(ClassifyError::MemberEmpty { member: name });
        }

        if member.size.abs_diff(expected_bytes) > geometry.tolerance {
            return Err(ClassifyError::MemberSize {
                member: name,
                size: member.size,
                expected: expected_bytes,
            });
        }
    }

    Ok(())
}
