// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Migration configuration
//!
//! Loaded from a YAML file. Rates are in MiB per second.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::unit::{Geometry, UnitKind};

/// Default location of the instance lock
const DEFAULT_LOCK_FILE: &str = "/var/tmp/sector-mover.lock";

const DEFAULT_HASH_CHUNKS: u32 = 16;
const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
const DEFAULT_AUX_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 300;
const DEFAULT_DISK_CHECK_TIMEOUT_SECS: u64 = 600;

/// Fewer samples than this miss too much of a large file
pub const MIN_HASH_CHUNKS: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("no source nodes configured")]
    NoSourceNodes,

    #[error("no destination nodes configured")]
    NoDestinationNodes,

    #[error("single_thread_mbps must be greater than zero")]
    ZeroSingleThreadRate,

    #[error("hash_chunks is {0}, must be at least {MIN_HASH_CHUNKS}")]
    TooFewHashChunks(u32),

    #[error("transfer_rate_mbps must be greater than zero when set")]
    ZeroTransferRate,

    #[error("no unit kinds selected")]
    NoKinds,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("invalid geometry: {0}")]
    Geometry(String),
}

/// One storage root on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    pub location: PathBuf,
    /// Concurrent transfers into this path; defaults to the node limit
    #[serde(default)]
    pub limit: Option<u32>,
}

/// A storage node as seen from this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub address: String,
    pub bandwidth_mbps: u32,
    #[serde(default)]
    pub paths: Vec<PathConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub src_nodes: Vec<NodeConfig>,
    pub dst_nodes: Vec<NodeConfig>,

    /// Throughput a single copy is expected to reach; divides node
    /// bandwidth into concurrency slots
    pub single_thread_mbps: u32,

    /// Samples taken per file by the idempotence check
    #[serde(default = "default_hash_chunks")]
    pub hash_chunks: u32,

    /// Optional per-transfer throughput cap
    #[serde(default)]
    pub transfer_rate_mbps: Option<u32>,

    #[serde(default = "default_kinds")]
    pub kinds: Vec<UnitKind>,

    /// Skip units that fail classification instead of aborting
    #[serde(default)]
    pub skip_invalid_units: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_aux_poll_interval_ms")]
    pub aux_poll_interval_ms: u64,

    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    #[serde(default = "default_disk_check_timeout_secs")]
    pub disk_check_timeout_secs: u64,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Prometheus text file rewritten on each snapshot
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,

    #[serde(default)]
    pub geometry: Geometry,
}

fn default_hash_chunks() -> u32 {
    DEFAULT_HASH_CHUNKS
}

fn default_kinds() -> Vec<UnitKind> {
    UnitKind::ALL.to_vec()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_aux_poll_interval_ms() -> u64 {
    DEFAULT_AUX_POLL_INTERVAL_MS
}

fn default_snapshot_interval_secs() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL_SECS
}

fn default_disk_check_timeout_secs() -> u64 {
    DEFAULT_DISK_CHECK_TIMEOUT_SECS
}

fn default_lock_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_FILE)
}

impl MigrationConfig {
    /// Read, parse and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration document; home directories are expanded but
    /// nothing is validated.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let mut config: Self = serde_yaml::from_str(text)?;
        for node in config.src_nodes.iter_mut().chain(config.dst_nodes.iter_mut()) {
            for path in &mut node.paths {
                path.location = expand_home(&path.location);
            }
        }
        config.lock_file = expand_home(&config.lock_file);
        config.metrics_file = config.metrics_file.as_deref().map(expand_home);
        Ok(config)
    }

    /// Check settings that do not depend on node layout. Node and path
    /// problems are reported when the capacity registry is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.src_nodes.is_empty() {
            return Err(ConfigError::NoSourceNodes);
        }
        if self.dst_nodes.is_empty() {
            return Err(ConfigError::NoDestinationNodes);
        }
        if self.single_thread_mbps == 0 {
            return Err(ConfigError::ZeroSingleThreadRate);
        }
        if self.hash_chunks < MIN_HASH_CHUNKS {
            return Err(ConfigError::TooFewHashChunks(self.hash_chunks));
        }
        if self.transfer_rate_mbps == Some(0) {
            return Err(ConfigError::ZeroTransferRate);
        }
        if self.kinds.is_empty() {
            return Err(ConfigError::NoKinds);
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("aux_poll_interval_ms", self.aux_poll_interval_ms),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
            ("disk_check_timeout_secs", self.disk_check_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        self.geometry.validate().map_err(ConfigError::Geometry)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn aux_poll_interval(&self) -> Duration {
        Duration::from_millis(self.aux_poll_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn disk_check_timeout(&self) -> Duration {
        Duration::from_secs(self.disk_check_timeout_secs)
    }

    /// Per-transfer cap in bytes per second, if any
    pub fn transfer_rate_bytes(&self) -> Option<u64> {
        self.transfer_rate_mbps.map(|mbps| u64::from(mbps) << 20)
    }

    pub fn wants(&self, kind: UnitKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Replace a leading `~` with the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
src_nodes:
  - address: 10.0.0.11
    bandwidth_mbps: 1000
    paths:
      - location: /mnt/src-a
dst_nodes:
  - address: 10.0.1.21
    bandwidth_mbps: 2000
    paths:
      - location: /mnt/dst-a
        limit: 4
      - location: /mnt/dst-b
single_thread_mbps: 250
"#;

    #[test]
    fn defaults_are_filled_in() {
        let config = MigrationConfig::from_yaml(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.hash_chunks, 16);
        assert_eq!(config.kinds, UnitKind::ALL.to_vec());
        assert!(!config.skip_invalid_units);
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.aux_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.snapshot_interval(), Duration::from_secs(300));
        assert_eq!(config.disk_check_timeout(), Duration::from_secs(600));
        assert_eq!(config.lock_file, PathBuf::from("/var/tmp/sector-mover.lock"));
        assert_eq!(config.geometry, Geometry::default());
        assert_eq!(config.transfer_rate_bytes(), None);

        let dst = &config.dst_nodes[0];
        assert_eq!(dst.paths[0].limit, Some(4));
        assert_eq!(dst.paths[1].limit, None);
    }

    #[test]
    fn kinds_and_geometry_parse() {
        let text = format!(
            "{}kinds: [sealed, cache]\ntransfer_rate_mbps: 200\ngeometry:\n  tree_r_bytes: 4096\n",
            MINIMAL
        );
        let config = MigrationConfig::from_yaml(&text).unwrap();
        assert!(config.wants(UnitKind::Primary));
        assert!(config.wants(UnitKind::Auxiliary));
        assert!(!config.wants(UnitKind::Secondary));
        assert_eq!(config.transfer_rate_bytes(), Some(200 << 20));
        assert_eq!(config.geometry.tree_r_bytes, 4096);
        assert_eq!(config.geometry.tree_r_count_32g, 8);
    }

    #[test]
    fn validation_errors() {
        let base = MigrationConfig::from_yaml(MINIMAL).unwrap();

        let mut config = base.clone();
        config.src_nodes.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoSourceNodes)));

        let mut config = base.clone();
        config.dst_nodes.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoDestinationNodes)
        ));

        let mut config = base.clone();
        config.single_thread_mbps = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroSingleThreadRate)
        ));

        let mut config = base.clone();
        config.hash_chunks = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooFewHashChunks(2))
        ));

        let mut config = base.clone();
        config.transfer_rate_mbps = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTransferRate)));

        let mut config = base.clone();
        config.kinds.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoKinds)));

        let mut config = base.clone();
        config.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("poll_interval_ms"))
        ));

        let mut config = base.clone();
        config.geometry.sector_bytes_64g = config.geometry.sector_bytes_32g;
        assert!(matches!(config.validate(), Err(ConfigError::Geometry(_))));

        let mut config = base;
        config.geometry.tree_r_bytes = u64::MAX / 2;
        assert!(matches!(config.validate(), Err(ConfigError::Geometry(_))));
    }

    #[test]
    fn from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            MigrationConfig::from_file(&missing),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "src_nodes: [").unwrap();
        assert!(matches!(
            MigrationConfig::from_file(&bad),
            Err(ConfigError::Parse { .. })
        ));

        let good = dir.path().join("good.yaml");
        std::fs::write(&good, MINIMAL).unwrap();
        MigrationConfig::from_file(&good).unwrap();
    }

    #[test]
    fn home_is_expanded() {
        let expanded = expand_home(Path::new("~/sector-mover.yaml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("sector-mover.yaml"));
        }
        assert_eq!(
            expand_home(Path::new("/etc/sector-mover.yaml")),
            PathBuf::from("/etc/sector-mover.yaml")
        );
    }
}
