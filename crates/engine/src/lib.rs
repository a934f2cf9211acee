//! tabsync reconciliation engine.
//!
//! Data flows strictly downward each cycle: derivation over the listed
//! resources, identity resolution, diff against the remote set, then the
//! executor applies the plan. The loop driver is the only component with a
//! lifecycle and cross-cycle memory.

#![forbid(unsafe_code)]

pub mod derive;
pub mod desired;
pub mod diff;
pub mod driver;
pub mod exec;
pub mod resolve;

use std::time::Duration;

use tabsync_core::SyncPolicy;

/// Engine knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sync_policy: SyncPolicy,
    /// Period between timer-triggered reconciliations.
    pub interval: Duration,
    /// Quiet window after a change notification before reconciling, so event
    /// bursts collapse into one cycle.
    pub debounce: Duration,
    /// Compute and log plans without applying them.
    pub dry_run: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            sync_policy: SyncPolicy::Upsert,
            interval: Duration::from_secs(60),
            debounce: Duration::from_millis(500),
            dry_run: false,
        }
    }
}
