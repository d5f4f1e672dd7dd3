// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Migration context
//!
//! Wires the registry, placement engine and executor together and runs the
//! phases of a migration in order: discovery, destination check, scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MigrationConfig;
use crate::discovery::{mark_present, scan_sources};
use crate::fsstat::{SpaceProbe, StatvfsProbe, check_disk_size};
use crate::placement::PlacementEngine;
use crate::registry::CapacityRegistry;
use crate::scheduler::{RunSummary, Scheduler, SchedulerOptions};
use crate::transfer::{FileTransfer, Transfer, TransferOptions};
use crate::unit::{TransferUnit, UnitStatus};

const GIB: f64 = (1u64 << 30) as f64;

pub struct MigrationContext<T: Transfer = FileTransfer, P: SpaceProbe = StatvfsProbe> {
    config: MigrationConfig,
    registry: Arc<CapacityRegistry>,
    probe: Arc<P>,
    executor: Arc<T>,
    stop: CancellationToken,
}

impl MigrationContext {
    /// Context backed by local files and `statvfs`
    pub fn new(config: MigrationConfig, stop: CancellationToken) -> Result<Self> {
        let executor = FileTransfer::new(
            TransferOptions {
                rate_limit: config.transfer_rate_bytes(),
                hash_chunks: config.hash_chunks,
            },
            stop.clone(),
        );
        Self::with_parts(config, Arc::new(StatvfsProbe), Arc::new(executor), stop)
    }
}

impl<T: Transfer, P: SpaceProbe> MigrationContext<T, P> {
    pub fn with_parts(
        config: MigrationConfig,
        probe: Arc<P>,
        executor: Arc<T>,
        stop: CancellationToken,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let registry =
            Arc::new(CapacityRegistry::from_config(&config).context("invalid node layout")?);
        Ok(Self {
            config,
            registry,
            probe,
            executor,
            stop,
        })
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Scan the sources and mark units already present at a destination.
    pub async fn discover(&self) -> Result<Vec<TransferUnit>> {
        let config = self.config.clone();
        let mut units = tokio::task::spawn_blocking(move || scan_sources(&config))
            .await
            .context("source scan task failed")?
            .context("failed to scan sources")?;

        let roots = self
            .registry
            .destination_roots()
            .into_iter()
            .map(|(node, _, root)| (node, root))
            .collect();
        mark_present(&mut units, roots, self.config.hash_chunks, num_cpus::get())
            .await
            .context("idempotence check failed")?;

        Ok(units)
    }

    /// Make sure every destination path answers a stat in time and can hold
    /// the largest pending unit. Warns when all destinations together have
    /// less free space than the pending units need.
    pub async fn check_destinations(&self, units: &[TransferUnit]) -> Result<()> {
        let pending: Vec<&TransferUnit> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Waiting)
            .collect();
        let largest = pending.iter().map(|u| u.total_bytes).max().unwrap_or(0);
        let needed: u64 = pending.iter().map(|u| u.total_bytes).sum();

        let mut available = 0u64;
        let mut checked = false;
        for (node, _, root) in self.registry.destination_roots() {
            let stats = check_disk_size(
                Arc::clone(&self.probe),
                &root,
                largest,
                self.config.disk_check_timeout(),
            )
            .await
            .with_context(|| {
                format!("destination {} on {} failed its disk check", root.display(), node)
            })?;
            if let Some(stats) = stats {
                available = available.saturating_add(stats.available);
                checked = true;
            }
        }

        if checked && available < needed {
            warn!(
                needed_gib = needed as f64 / GIB,
                available_gib = available as f64 / GIB,
                "destinations may not have enough free space for every pending unit"
            );
        }
        Ok(())
    }

    /// Run a full migration.
    pub async fn run(&self) -> Result<RunSummary> {
        let units = self.discover().await?;
        let pending = units
            .iter()
            .filter(|u| u.status == UnitStatus::Waiting)
            .count();
        info!(
            units = units.len(),
            pending,
            already_present = units.len() - pending,
            "discovery finished"
        );

        self.check_destinations(&units).await?;

        let placement = PlacementEngine::new(Arc::clone(&self.registry), Arc::clone(&self.probe));
        let mut scheduler = Scheduler::new(
            units,
            Arc::clone(&self.registry),
            placement,
            Arc::clone(&self.executor),
            SchedulerOptions::from_config(&self.config),
            self.stop.clone(),
        );
        Ok(scheduler.run().await)
    }
}
