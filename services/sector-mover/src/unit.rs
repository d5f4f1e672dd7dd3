// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Transfer units
//!
//! A transfer unit is one component of one sector: the sealed replica, its
//! cache directory, or the unsealed copy. All three share a lifecycle, so
//! they are modelled as a single [`TransferUnit`] tagged with a [`UnitKind`].
//! The kind decides the on-disk layout and the manifest of files to move.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Small fixed-size member of a cache directory
pub const P_AUX: &str = "p_aux";

/// Small fixed-size member of a cache directory
pub const T_AUX: &str = "t_aux";

pub const TREE_R_PREFIX: &str = "sc-02-data-tree-r-last-";
pub const TREE_R_SUFFIX: &str = ".dat";

/// Name of the `index`-th numbered tree file in a cache directory
pub fn tree_r_name(index: u32) -> String {
    format!("{}{}{}", TREE_R_PREFIX, index, TREE_R_SUFFIX)
}

/// The component of a sector a unit represents.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
pub enum UnitKind {
    /// Sealed replica, one large file under `sealed/`
    #[serde(rename = "sealed")]
    #[strum(serialize = "sealed")]
    Primary,
    /// Cache directory under `cache/` holding a fixed manifest of files
    #[serde(rename = "cache")]
    #[strum(serialize = "cache")]
    Auxiliary,
    /// Unsealed copy, one large file under `unsealed/`
    #[serde(rename = "unsealed")]
    #[strum(serialize = "unsealed")]
    Secondary,
}

impl UnitKind {
    /// Every kind, in the order discovery walks them
    pub const ALL: [UnitKind; 3] = [UnitKind::Primary, UnitKind::Auxiliary, UnitKind::Secondary];

    /// Directory under a storage root that holds units of this kind
    pub fn dir_name(self) -> &'static str {
        match self {
            UnitKind::Primary => "sealed",
            UnitKind::Auxiliary => "cache",
            UnitKind::Secondary => "unsealed",
        }
    }

    /// Whether a unit of this kind is a directory rather than a single file
    pub fn is_directory(self) -> bool {
        matches!(self, UnitKind::Auxiliary)
    }

    /// Sibling categories consulted for group affinity, highest priority first
    pub fn affinity_siblings(self) -> [UnitKind; 2] {
        match self {
            UnitKind::Primary => [UnitKind::Auxiliary, UnitKind::Secondary],
            UnitKind::Auxiliary => [UnitKind::Primary, UnitKind::Secondary],
            UnitKind::Secondary => [UnitKind::Primary, UnitKind::Auxiliary],
        }
    }

    /// Path of the unit `id` relative to a storage root
    pub fn relative_root(self, id: &str) -> PathBuf {
        Path::new(self.dir_name()).join(id)
    }

    /// Expected files for a unit of this kind and size class.
    ///
    /// Single-file kinds have exactly one entry. The cache directory lists the
    /// two small members first, then the numbered tree files.
    pub fn manifest(self, id: &str, class: SizeClass, geometry: &Geometry) -> Vec<ManifestEntry> {
        let root = self.relative_root(id);
        match self {
            UnitKind::Primary | UnitKind::Secondary => vec![ManifestEntry {
                relative: root,
                expected_bytes: geometry.sector_bytes(class),
            }],
            UnitKind::Auxiliary => {
                let mut entries = vec![
                    ManifestEntry {
                        relative: root.join(T_AUX),
                        expected_bytes: geometry.aux_member_bytes,
                    },
                    ManifestEntry {
                        relative: root.join(P_AUX),
                        expected_bytes: geometry.aux_member_bytes,
                    },
                ];
                entries.extend((0..geometry.tree_r_count(class)).map(|i| ManifestEntry {
                    relative: root.join(tree_r_name(i)),
                    expected_bytes: geometry.tree_r_bytes,
                }));
                entries
            }
        }
    }
}

/// One expected file of a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the storage root
    pub relative: PathBuf,
    /// Canonical size of the file
    pub expected_bytes: u64,
}

/// Canonical sector size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SizeClass {
    #[strum(serialize = "32GiB")]
    Gib32,
    #[strum(serialize = "64GiB")]
    Gib64,
}

impl SizeClass {
    pub const ALL: [SizeClass; 2] = [SizeClass::Gib32, SizeClass::Gib64];
}

/// Canonical sizes and manifest shape of sector artifacts.
///
/// The defaults describe real 32GiB and 64GiB sectors. Overriding them is
/// meant for staging runs and tests that work with small artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    /// Size of a sealed or unsealed file of a 32GiB sector
    pub sector_bytes_32g: u64,
    /// Size of a sealed or unsealed file of a 64GiB sector
    pub sector_bytes_64g: u64,
    /// Size of one numbered tree file in a cache directory
    pub tree_r_bytes: u64,
    /// Number of tree files in the cache directory of a 32GiB sector
    pub tree_r_count_32g: u32,
    /// Number of tree files in the cache directory of a 64GiB sector
    pub tree_r_count_64g: u32,
    /// Size of `p_aux` and `t_aux`
    pub aux_member_bytes: u64,
    /// Allowed deviation of any single file from its canonical size
    pub tolerance: u64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            sector_bytes_32g: 32 << 30,
            sector_bytes_64g: 64 << 30,
            tree_r_bytes: 9_586_976,
            tree_r_count_32g: 8,
            tree_r_count_64g: 16,
            aux_member_bytes: 64,
            tolerance: 16 << 10,
        }
    }
}

impl Geometry {
    pub fn sector_bytes(&self, class: SizeClass) -> u64 {
        match class {
            SizeClass::Gib32 => self.sector_bytes_32g,
            SizeClass::Gib64 => self.sector_bytes_64g,
        }
    }

    pub fn tree_r_count(&self, class: SizeClass) -> u32 {
        match class {
            SizeClass::Gib32 => self.tree_r_count_32g,
            SizeClass::Gib64 => self.tree_r_count_64g,
        }
    }

    /// Number of files in a cache directory of the given class
    pub fn manifest_len(&self, class: SizeClass) -> u64 {
        u64::from(self.tree_r_count(class)) + 2
    }

    /// Canonical summed size of a cache directory of the given class
    pub fn manifest_total(&self, class: SizeClass) -> u64 {
        self.checked_manifest_total(class).unwrap_or(u64::MAX)
    }

    /// Allowed deviation of a cache directory total: each member may drift
    /// by the per-file tolerance.
    pub fn manifest_tolerance(&self, class: SizeClass) -> u64 {
        self.checked_manifest_tolerance(class).unwrap_or(u64::MAX)
    }

    fn checked_manifest_total(&self, class: SizeClass) -> Option<u64> {
        self.tree_r_bytes
            .checked_mul(u64::from(self.tree_r_count(class)))?
            .checked_add(self.aux_member_bytes.checked_mul(2)?)
    }

    fn checked_manifest_tolerance(&self, class: SizeClass) -> Option<u64> {
        self.tolerance.checked_mul(self.manifest_len(class))
    }

    /// Reject geometries where a size could match both classes, or whose
    /// cache directory sizes do not fit in 64 bits.
    pub fn validate(&self) -> Result<(), String> {
        if self.sector_bytes_32g == 0 || self.sector_bytes_64g == 0 || self.tree_r_bytes == 0 {
            return Err("canonical sizes must be non-zero".to_string());
        }
        if self.tree_r_count_32g == 0 || self.tree_r_count_64g == 0 {
            return Err("tree file counts must be non-zero".to_string());
        }
        let file_gap = self.sector_bytes_32g.abs_diff(self.sector_bytes_64g);
        let file_slack = self
            .tolerance
            .checked_mul(2)
            .ok_or_else(|| format!("tolerance {} is too large", self.tolerance))?;
        if file_gap <= file_slack {
            return Err(format!(
                "sector sizes {} and {} are within twice the tolerance {}",
                self.sector_bytes_32g, self.sector_bytes_64g, self.tolerance
            ));
        }
        for class in SizeClass::ALL {
            if self.checked_manifest_total(class).is_none() {
                return Err(format!("{} cache directory size overflows", class));
            }
        }
        let dir_slack = self
            .checked_manifest_tolerance(SizeClass::Gib32)
            .zip(self.checked_manifest_tolerance(SizeClass::Gib64))
            .and_then(|(small, large)| small.checked_add(large))
            .ok_or_else(|| format!("tolerance {} is too large", self.tolerance))?;
        let dir_gap = self
            .manifest_total(SizeClass::Gib32)
            .abs_diff(self.manifest_total(SizeClass::Gib64));
        if dir_gap <= dir_slack {
            return Err(format!(
                "cache directory totals {} and {} overlap within tolerance",
                self.manifest_total(SizeClass::Gib32),
                self.manifest_total(SizeClass::Gib64)
            ));
        }
        Ok(())
    }
}

/// Scheduling status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnitStatus {
    /// Eligible for admission on the next pass
    Waiting,
    /// A transfer is in flight and holds reservations
    Working,
    /// Copied, or found already present at a destination
    Done,
}

/// One component of one sector, tracked from discovery to completion
#[derive(Debug, Clone)]
pub struct TransferUnit {
    /// Logical sector ID shared by all components
    pub id: String,
    pub kind: UnitKind,
    /// Address of the source node
    pub source_node: String,
    /// Storage root on the source node the unit was found under
    pub source_root: PathBuf,
    /// Files of the unit, relative to the storage root
    pub files: Vec<PathBuf>,
    /// Summed size of `files`
    pub total_bytes: u64,
    pub size_class: SizeClass,
    /// Destination node, once placed or found present
    pub dest_node: Option<String>,
    /// Destination storage root, once placed or found present
    pub dest_root: Option<PathBuf>,
    pub status: UnitStatus,
    /// Number of transfer attempts started
    pub attempts: u32,
    /// Set once the affinity target turned out to lack space; placement then
    /// goes straight to fresh selection.
    pub affinity_blocked: bool,
}

impl TransferUnit {
    pub fn new(
        id: impl Into<String>,
        kind: UnitKind,
        source_node: impl Into<String>,
        source_root: impl Into<PathBuf>,
        size_class: SizeClass,
        files: Vec<PathBuf>,
        total_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            source_node: source_node.into(),
            source_root: source_root.into(),
            files,
            total_bytes,
            size_class,
            dest_node: None,
            dest_root: None,
            status: UnitStatus::Waiting,
            attempts: 0,
            affinity_blocked: false,
        }
    }

    /// Path of the unit (file or directory) relative to a storage root
    pub fn relative_root(&self) -> PathBuf {
        self.kind.relative_root(&self.id)
    }

    /// Absolute source paths of every file in the unit
    pub fn source_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.files.iter().map(|rel| self.source_root.join(rel))
    }

    /// Pairs of (source, destination) paths with the source root replaced by
    /// `dest_root`
    pub fn path_pairs<'a>(
        &'a self,
        dest_root: &'a Path,
    ) -> impl Iterator<Item = (PathBuf, PathBuf)> + 'a {
        self.files
            .iter()
            .map(move |rel| (self.source_root.join(rel), dest_root.join(rel)))
    }

    /// Where a sibling component of the same sector would live under `root`
    pub fn sibling_path(&self, root: &Path, sibling: UnitKind) -> PathBuf {
        root.join(sibling.relative_root(&self.id))
    }

    /// Record the destination chosen for this unit
    pub fn set_destination(&mut self, node: impl Into<String>, root: impl Into<PathBuf>) {
        self.dest_node = Some(node.into());
        self.dest_root = Some(root.into());
    }
}

impl fmt::Display for TransferUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.kind, self.id, self.source_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn kind_names_match_directories() {
        for kind in UnitKind::ALL {
            assert_eq!(kind.to_string(), kind.dir_name());
            assert_eq!(UnitKind::from_str(kind.dir_name()).unwrap(), kind);
        }
    }

    #[test]
    fn siblings_never_include_self() {
        for kind in UnitKind::ALL {
            assert!(!kind.affinity_siblings().contains(&kind));
        }
    }

    #[test]
    fn cache_manifest_shape() {
        let geometry = Geometry::default();
        let manifest = UnitKind::Auxiliary.manifest("s-t01-1", SizeClass::Gib32, &geometry);
        assert_eq!(manifest.len(), 10);
        assert_eq!(manifest[0].relative, PathBuf::from("cache/s-t01-1/t_aux"));
        assert_eq!(manifest[1].relative, PathBuf::from("cache/s-t01-1/p_aux"));
        assert_eq!(
            manifest[9].relative,
            PathBuf::from("cache/s-t01-1/sc-02-data-tree-r-last-7.dat")
        );
        let total: u64 = manifest.iter().map(|m| m.expected_bytes).sum();
        assert_eq!(total, geometry.manifest_total(SizeClass::Gib32));

        let big = UnitKind::Auxiliary.manifest("s-t01-1", SizeClass::Gib64, &geometry);
        assert_eq!(big.len(), 18);
    }

    #[test]
    fn single_file_manifest() {
        let geometry = Geometry::default();
        let manifest = UnitKind::Secondary.manifest("s-t01-9", SizeClass::Gib64, &geometry);
        assert_eq!(
            manifest,
            vec![ManifestEntry {
                relative: PathBuf::from("unsealed/s-t01-9"),
                expected_bytes: 64 << 30,
            }]
        );
    }

    #[test]
    fn default_geometry_is_valid() {
        Geometry::default().validate().unwrap();
    }

    #[test]
    fn overlapping_geometry_is_rejected() {
        let geometry = Geometry {
            sector_bytes_32g: 1000,
            sector_bytes_64g: 1010,
            tolerance: 16,
            ..Geometry::default()
        };
        assert!(geometry.validate().is_err());
    }

    #[test]
    fn oversized_geometry_is_rejected_without_overflow() {
        let huge_tree = Geometry {
            tree_r_bytes: u64::MAX / 4,
            ..Geometry::default()
        };
        assert_eq!(
            huge_tree.validate(),
            Err("32GiB cache directory size overflows".to_string())
        );

        let huge_aux = Geometry {
            aux_member_bytes: u64::MAX,
            ..Geometry::default()
        };
        assert!(huge_aux.validate().is_err());

        let huge_tolerance = Geometry {
            sector_bytes_32g: 1,
            sector_bytes_64g: u64::MAX,
            tolerance: u64::MAX / 4,
            ..Geometry::default()
        };
        assert!(huge_tolerance.validate().is_err());
    }

    #[test]
    fn destination_paths_swap_roots() {
        let unit = TransferUnit::new(
            "s-t01-3",
            UnitKind::Primary,
            "10.0.0.1",
            "/mnt/src",
            SizeClass::Gib32,
            vec![PathBuf::from("sealed/s-t01-3")],
            32 << 30,
        );
        let pairs: Vec<_> = unit.path_pairs(Path::new("/mnt/dst")).collect();
        assert_eq!(
            pairs,
            vec![(
                PathBuf::from("/mnt/src/sealed/s-t01-3"),
                PathBuf::from("/mnt/dst/sealed/s-t01-3")
            )]
        );
        assert_eq!(
            unit.sibling_path(Path::new("/mnt/dst"), UnitKind::Auxiliary),
            PathBuf::from("/mnt/dst/cache/s-t01-3")
        );
        assert_eq!(unit.to_string(), "sealed/s-t01-3@10.0.0.1");
    }
}
