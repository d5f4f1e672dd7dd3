// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Sector Mover Library
//!
//! Migrates sector artifacts from a set of source storage nodes to a set of
//! destination storage nodes over locally mounted paths. A sector has up to
//! three components, each moved as its own transfer unit: the sealed
//! replica, the cache directory and the unsealed copy.
//!
//! # Modules
//!
//! - [`config`] - YAML configuration and validation
//! - [`unit`] - Transfer units, kinds, size classes and manifests
//! - [`classify`] - Size class detection and cache manifest checks
//! - [`registry`] - Per-node and per-path concurrency accounting
//! - [`placement`] - Destination selection with sibling affinity
//! - [`verify`] - Sampled-hash idempotence check
//! - [`discovery`] - Source scan and already-present detection
//! - [`transfer`] - Atomic, rate limited file copies
//! - [`scheduler`] - The admission loop and unit state machine
//! - [`context`] - Wiring for a complete migration run
//! - [`fsstat`] - Free-space probes and the destination disk check
//! - [`lock`] - Single-instance lock
//! - [`metrics`] - Prometheus metrics

pub mod classify;
pub mod config;
pub mod context;
pub mod discovery;
pub mod fsstat;
pub mod lock;
pub mod metrics;
pub mod placement;
pub mod registry;
pub mod scheduler;
pub mod transfer;
pub mod unit;
pub mod verify;

#[cfg(test)]
mod test_support;
