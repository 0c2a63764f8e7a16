// SPDX-License-Identifier: MIT

//! Telemetry sink.
//!
//! Recording never fails from the caller's point of view.  Embedders plug in
//! their own sink; the default one emits `tracing` events on the
//! `gracklebroker::telemetry` target.

use tracing::info;

/// Keyed count of spawn hard failures, keyed by `kind/0x<os error>`.
pub const SANDBOX_FAILED_LAUNCH_KEYED: &str = "sandbox_failed_launch_keyed";

/// Set once when a launch runs without a job; keyed `local` or `remote`.
pub const SANDBOX_NO_JOB: &str = "sandbox_no_job";

pub trait Telemetry: Send + Sync {
    fn accumulate_keyed(&self, metric: &'static str, key: &str, value: u32);

    fn scalar_set(&self, metric: &'static str, key: &str, value: bool);
}

/// Emits every record as a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn accumulate_keyed(&self, metric: &'static str, key: &str, value: u32) {
        info!(target: "gracklebroker::telemetry", metric, key, value, "accumulate");
    }

    fn scalar_set(&self, metric: &'static str, key: &str, value: bool) {
        info!(target: "gracklebroker::telemetry", metric, key, value, "scalar");
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn accumulate_keyed(&self, _metric: &'static str, _key: &str, _value: u32) {}

    fn scalar_set(&self, _metric: &'static str, _key: &str, _value: bool) {}
}
