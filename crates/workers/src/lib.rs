//! Fleet workers: the reconciler loop and the workers it drives.
//!
//! `Reconciler` ticks every registered `Worker` on its own interval.
//! `LeaderWorker` restricts a worker to the instance holding a lease,
//! `StartupGate` publishes readiness once the stored types match the catalog.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod gate;
pub mod leader;
pub mod reconciler;
pub mod resources;
pub mod types;
mod worker;

pub use gate::{AllOf, ConvergenceCheck, Readiness, StartupGate};
pub use leader::LeaderWorker;
pub use reconciler::{Reconciler, TickState};
pub use resources::{DeletingResourceManager, ResourceDeploymentManager};
pub use types::{RemovedTypes, TypeManager, TypeService};
pub use worker::Worker;

/// Timing knobs for the workers and the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub lease_ttl: Duration,
    pub gate_poll: Duration,
    pub type_interval: Duration,
    pub resource_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            gate_poll: Duration::from_secs(5),
            type_interval: Duration::from_secs(5),
            resource_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerSettings {
    /// Defaults overridden by `FLEET_LEASE_SECS`, `FLEET_GATE_POLL_SECS`,
    /// `FLEET_TYPE_INTERVAL_SECS` and `FLEET_RESOURCE_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lease_ttl: env_secs("FLEET_LEASE_SECS").unwrap_or(d.lease_ttl),
            gate_poll: env_secs("FLEET_GATE_POLL_SECS").unwrap_or(d.gate_poll),
            type_interval: env_secs("FLEET_TYPE_INTERVAL_SECS").unwrap_or(d.type_interval),
            resource_interval: env_secs("FLEET_RESOURCE_INTERVAL_SECS").unwrap_or(d.resource_interval),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok()).filter(|s| *s > 0).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("FLEET_GATE_POLL_SECS", "2");
        std::env::set_var("FLEET_RESOURCE_INTERVAL_SECS", "not-a-number");
        let s = WorkerSettings::from_env();
        assert_eq!(s.gate_poll, Duration::from_secs(2));
        assert_eq!(s.resource_interval, WorkerSettings::default().resource_interval);
        std::env::remove_var("FLEET_GATE_POLL_SECS");
        std::env::remove_var("FLEET_RESOURCE_INTERVAL_SECS");
    }
}
