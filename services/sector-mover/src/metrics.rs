// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for sector migration
//!
//! There is no HTTP endpoint; the scheduler renders these into a text file
//! that a node exporter textfile collector can pick up.

use std::path::Path;

use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

// Metric definitions are constant and only fail on a malformed name, so
// the expect calls are scoped to this module.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref REGISTRY: Registry = Registry::new();

        /// Bytes copied to destinations
        pub static ref BYTES_TOTAL: Counter = Counter::with_opts(
            Opts::new("sector_mover_bytes_total", "Total bytes transferred")
        ).expect("valid metric name");

        /// Units by outcome
        pub static ref UNITS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("sector_mover_units_total", "Units processed by status"),
            &["status"]
        ).expect("valid metric name and labels");

        /// Failed transfer attempts by error type
        pub static ref TRANSFER_ERRORS: CounterVec = CounterVec::new(
            Opts::new("sector_mover_transfer_errors_total", "Transfer errors by type"),
            &["error_type"]
        ).expect("valid metric name and labels");

        pub static ref TRANSFER_DURATION: Histogram = Histogram::with_opts(
            HistogramOpts::new(
                "sector_mover_transfer_duration_seconds",
                "Unit transfer time in seconds"
            )
            // Buckets: 10s, 30s, 1m, 2m, 5m, 10m, 20m, 30m, 1h, 2h
            .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0])
        ).expect("valid histogram opts");

        /// Units with a transfer in flight
        pub static ref WORKING_UNITS: IntGauge = IntGauge::with_opts(
            Opts::new("sector_mover_working_units", "Units currently being transferred")
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    BYTES_TOTAL, REGISTRY, TRANSFER_DURATION, TRANSFER_ERRORS, UNITS_TOTAL, WORKING_UNITS,
};

/// Register all metrics with the registry. Repeated calls are harmless.
pub fn register_metrics() {
    let collectors: [Box<dyn prometheus::core::Collector>; 5] = [
        Box::new(BYTES_TOTAL.clone()),
        Box::new(UNITS_TOTAL.clone()),
        Box::new(TRANSFER_ERRORS.clone()),
        Box::new(TRANSFER_DURATION.clone()),
        Box::new(WORKING_UNITS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!(error = %e, "metric already registered");
        }
    }
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Replace `path` with the current metrics text
pub fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, gather_metrics())?;
    std::fs::rename(&tmp, path)
}

pub fn record_unit_completed(bytes: u64, duration_secs: f64) {
    BYTES_TOTAL.inc_by(bytes as f64);
    UNITS_TOTAL.with_label_values(&["completed"]).inc();
    TRANSFER_DURATION.observe(duration_secs);
}

pub fn record_unit_already_present() {
    UNITS_TOTAL.with_label_values(&["already_present"]).inc();
}

pub fn record_unit_invalid() {
    UNITS_TOTAL.with_label_values(&["invalid"]).inc();
}

pub fn record_transfer_failed(error_type: &str) {
    UNITS_TOTAL.with_label_values(&["failed_attempt"]).inc();
    TRANSFER_ERRORS.with_label_values(&[error_type]).inc();
}

pub fn set_working_units(count: usize) {
    WORKING_UNITS.set(count as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_unit_completed() {
        let before_bytes = BYTES_TOTAL.get();
        let before_completed = UNITS_TOTAL.with_label_values(&["completed"]).get();
        let before_samples = TRANSFER_DURATION.get_sample_count();

        record_unit_completed(1024, 2.5);

        // Tests run in parallel and may bump the same counters.
        assert!(BYTES_TOTAL.get() - before_bytes >= 1024.0);
        assert!(UNITS_TOTAL.with_label_values(&["completed"]).get() - before_completed >= 1.0);
        assert!(TRANSFER_DURATION.get_sample_count() - before_samples >= 1);
    }

    #[test]
    fn test_record_transfer_failed() {
        let before_failed = UNITS_TOTAL.with_label_values(&["failed_attempt"]).get();
        let before_io = TRANSFER_ERRORS.with_label_values(&["test_io"]).get();

        record_transfer_failed("test_io");

        assert!(UNITS_TOTAL.with_label_values(&["failed_attempt"]).get() - before_failed >= 1.0);
        assert_eq!(TRANSFER_ERRORS.with_label_values(&["test_io"]).get() - before_io, 1.0);
    }

    #[test]
    fn test_write_metrics_file() {
        register_metrics();
        register_metrics();
        record_unit_already_present();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sector-mover.prom");
        write_metrics_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("sector_mover_units_total"));
        assert!(!dir.path().join("sector-mover.prom.tmp").exists());
    }
}
