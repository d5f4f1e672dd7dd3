// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Scheduler loop
//!
//! Drives every unit through `Waiting -> Working -> Done`. Each pass reaps
//! finished transfers, then admits as many waiting units as the registry
//! allows, one executor task per admitted unit. A failed transfer puts its
//! unit back to `Waiting`; there is no retry limit.
//!
//! The loop runs on a single task and is the only writer of unit state.
//! Executor tasks own their [`Reservation`] and release it before they
//! report back, so a unit is never `Waiting` while still holding slots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::fsstat::SpaceProbe;
use crate::metrics;
use crate::placement::{PlacedSibling, PlacementEngine, PlacementError};
use crate::registry::{CapacityRegistry, Reservation};
use crate::transfer::{Transfer, TransferError};
use crate::unit::{TransferUnit, UnitKind, UnitStatus};

/// How often a stopping scheduler checks for running transfers
const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    /// Shorter poll used while cache directories are waiting; they are
    /// small and finish quickly.
    pub aux_poll_interval: Duration,
    pub snapshot_interval: Duration,
    pub drain_interval: Duration,
    pub metrics_file: Option<PathBuf>,
}

impl SchedulerOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            aux_poll_interval: config.aux_poll_interval(),
            snapshot_interval: config.snapshot_interval(),
            drain_interval: DRAIN_INTERVAL,
            metrics_file: config.metrics_file.clone(),
        }
    }
}

/// Result of a scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Units done, including those found already present
    pub done: usize,
    /// Units still waiting when the run ended
    pub waiting: usize,
    /// Bytes written by this run
    pub bytes: u64,
    /// Failed transfer attempts
    pub failures: u64,
    /// The run ended because of a stop request
    pub interrupted: bool,
}

struct Outcome {
    index: usize,
    result: Result<u64, TransferError>,
    elapsed: Duration,
}

pub struct Scheduler<T: Transfer, P: SpaceProbe> {
    units: Vec<TransferUnit>,
    /// Indices of the other components of each unit's sector
    siblings: Vec<Vec<usize>>,
    registry: Arc<CapacityRegistry>,
    placement: PlacementEngine<P>,
    executor: Arc<T>,
    options: SchedulerOptions,
    stop: CancellationToken,
    tasks: JoinSet<Outcome>,
    running: HashMap<Id, usize>,
    bytes: u64,
    failures: u64,
}

impl<T: Transfer, P: SpaceProbe> Scheduler<T, P> {
    pub fn new(
        units: Vec<TransferUnit>,
        registry: Arc<CapacityRegistry>,
        placement: PlacementEngine<P>,
        executor: Arc<T>,
        options: SchedulerOptions,
        stop: CancellationToken,
    ) -> Self {
        let mut by_id: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, unit) in units.iter().enumerate() {
            by_id.entry(unit.id.as_str()).or_default().push(index);
        }
        let siblings = units
            .iter()
            .enumerate()
            .map(|(index, unit)| {
                by_id
                    .get(unit.id.as_str())
                    .map(|group| group.iter().copied().filter(|&i| i != index).collect())
                    .unwrap_or_default()
            })
            .collect();

        Self {
            units,
            siblings,
            registry,
            placement,
            executor,
            options,
            stop,
            tasks: JoinSet::new(),
            running: HashMap::new(),
            bytes: 0,
            failures: 0,
        }
    }

    pub fn units(&self) -> &[TransferUnit] {
        &self.units
    }

    fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    /// Destinations of the components of `index`'s sector that are copying
    /// or done.
    fn placed_siblings(&self, index: usize) -> Vec<PlacedSibling> {
        self.siblings[index]
            .iter()
            .map(|&i| &self.units[i])
            .filter(|u| u.status != UnitStatus::Waiting)
            .filter_map(|u| {
                Some(PlacedSibling {
                    kind: u.kind,
                    node: u.dest_node.clone()?,
                    root: u.dest_root.clone()?,
                })
            })
            .collect()
    }

    /// Run until every unit is done, or until a stop request has been
    /// drained.
    pub async fn run(&mut self) -> RunSummary {
        info!(
            units = self.units.len(),
            waiting = self.count(UnitStatus::Waiting),
            "scheduler started"
        );
        let mut last_snapshot = Instant::now();

        loop {
            self.reap();

            if self.stop.is_cancelled() {
                break;
            }
            if self.count(UnitStatus::Waiting) == 0 && self.count(UnitStatus::Working) == 0 {
                break;
            }

            self.admit();

            if last_snapshot.elapsed() >= self.options.snapshot_interval {
                self.snapshot();
                last_snapshot = Instant::now();
            }

            let interval = if self
                .units
                .iter()
                .any(|u| u.status == UnitStatus::Waiting && u.kind == UnitKind::Auxiliary)
            {
                self.options.aux_poll_interval
            } else {
                self.options.poll_interval
            };
            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let interrupted = self.stop.is_cancelled();
        if interrupted {
            self.drain().await;
        }
        self.snapshot();

        let summary = RunSummary {
            done: self.count(UnitStatus::Done),
            waiting: self.count(UnitStatus::Waiting),
            bytes: self.bytes,
            failures: self.failures,
            interrupted,
        };
        info!(
            done = summary.done,
            waiting = summary.waiting,
            bytes = summary.bytes,
            failures = summary.failures,
            interrupted,
            "scheduler finished"
        );
        summary
    }

    async fn drain(&mut self) {
        info!(
            working = self.count(UnitStatus::Working),
            "stop requested, waiting for running transfers"
        );
        loop {
            self.reap();
            let working = self.count(UnitStatus::Working);
            if working == 0 {
                break;
            }
            debug!(working, "draining");
            tokio::time::sleep(self.options.drain_interval).await;
        }
    }

    /// Apply the results of every finished executor task.
    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            match joined {
                Ok((id, outcome)) => {
                    self.running.remove(&id);
                    self.finish(outcome);
                }
                Err(e) => {
                    let Some(index) = self.running.remove(&e.id()) else {
                        error!(error = %e, "unknown executor task failed");
                        continue;
                    };
                    let unit = &mut self.units[index];
                    error!(unit = %unit, error = %e, "executor task failed");
                    unit.status = UnitStatus::Waiting;
                    unit.dest_node = None;
                    unit.dest_root = None;
                    self.failures += 1;
                    metrics::record_transfer_failed("task");
                }
            }
        }
        metrics::set_working_units(self.running.len());
    }

    fn finish(&mut self, outcome: Outcome) {
        let unit = &mut self.units[outcome.index];
        match outcome.result {
            Ok(bytes) => {
                unit.status = UnitStatus::Done;
                self.bytes += bytes;
                metrics::record_unit_completed(bytes, outcome.elapsed.as_secs_f64());
                info!(
                    unit = %unit,
                    dest_node = unit.dest_node.as_deref().unwrap_or_default(),
                    bytes,
                    elapsed_secs = outcome.elapsed.as_secs(),
                    "unit transferred"
                );
            }
            Err(e) => {
                if e.is_stopped() {
                    debug!(unit = %unit, "transfer stopped");
                } else {
                    warn!(unit = %unit, attempt = unit.attempts, error = %e, "transfer failed");
                    self.failures += 1;
                    metrics::record_transfer_failed(e.error_type());
                }
                unit.status = UnitStatus::Waiting;
                unit.dest_node = None;
                unit.dest_root = None;
            }
        }
    }

    /// Start a transfer for every waiting unit that can get a source slot
    /// and a destination.
    fn admit(&mut self) {
        for index in 0..self.units.len() {
            if self.stop.is_cancelled() {
                return;
            }
            if self.units[index].status != UnitStatus::Waiting {
                continue;
            }

            let source = self.units[index].source_node.clone();
            if !self.registry.reserve_source(&source) {
                continue;
            }

            let placed = self.placed_siblings(index);
            let placement = match self.placement.place(&self.units[index], &placed) {
                Ok(placement) => placement,
                Err(e) => {
                    self.registry.release_source(&source);
                    let unit = &mut self.units[index];
                    match e {
                        PlacementError::AffinityNoSpace { .. } => {
                            warn!(unit = %unit, error = %e, "sibling path is full, placing elsewhere");
                            unit.affinity_blocked = true;
                        }
                        PlacementError::AffinityUnreadable { .. } => {
                            warn!(unit = %unit, error = %e, "sibling path unreadable, not placed");
                        }
                        PlacementError::AffinityBusy { .. }
                        | PlacementError::NoDestinationAvailable { .. } => {
                            debug!(unit = %unit, error = %e, "not placed this pass");
                        }
                    }
                    continue;
                }
            };

            let reservation = Reservation::new(
                Arc::clone(&self.registry),
                source,
                placement.node.clone(),
                placement.path_index,
            );
            let unit = &mut self.units[index];
            unit.set_destination(placement.node.clone(), placement.root.clone());
            unit.status = UnitStatus::Working;
            unit.attempts += 1;
            info!(
                unit = %unit,
                dest_node = %placement.node,
                dest_root = %placement.root.display(),
                attempt = unit.attempts,
                "transfer started"
            );

            let executor = Arc::clone(&self.executor);
            let job = unit.clone();
            let dest_root = placement.root;
            let handle = self.tasks.spawn(async move {
                let started = Instant::now();
                let result = executor.transfer(&job, &dest_root).await;
                drop(reservation);
                Outcome {
                    index,
                    result,
                    elapsed: started.elapsed(),
                }
            });
            self.running.insert(handle.id(), index);
        }
        metrics::set_working_units(self.running.len());
    }

    /// Log occupancy and unit counts, and refresh the metrics file.
    fn snapshot(&self) {
        for node in self.registry.source_snapshot() {
            info!(
                side = "source",
                node = %node.address,
                in_use = node.in_use,
                limit = node.limit,
                "occupancy"
            );
        }
        for node in self.registry.destination_snapshot() {
            info!(
                side = "destination",
                node = %node.address,
                in_use = node.in_use,
                limit = node.limit,
                "occupancy"
            );
            for path in &node.paths {
                debug!(
                    node = %node.address,
                    root = %path.root.display(),
                    in_use = path.in_use,
                    limit = path.limit,
                    "path occupancy"
                );
            }
        }
        info!(
            waiting = self.count(UnitStatus::Waiting),
            working = self.count(UnitStatus::Working),
            done = self.count(UnitStatus::Done),
            bytes = self.bytes,
            "progress"
        );

        if let Some(path) = &self.options.metrics_file
            && let Err(e) = metrics::write_metrics_file(path)
        {
            warn!(path = %path.display(), error = %e, "failed to write metrics file");
        }
    }
}
