//! Critical event reporting
//!
//! Internal consistency violations are reported here instead of failing the
//! call that detected them. Each report is logged at `error` level and
//! counted.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

static REPORTED: AtomicU64 = AtomicU64::new(0);

/// Named consistency violation
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum CriticalEvent {
    AgentDeviceNodeIdMismatch,
    PoolDeviceRackMismatch,
    DeviceNotFound,
    DiskNotFound,
    AgentNotFound,
    PlacementGroupNotFound,
    InvalidPlacementGroupPartition,
    BadMigrationDevice,
    InvalidDeviceBlockCount,
    ResizeCleanupFailure,
    ReplicaTableInconsistency,
    AutomaticReplacementFailure,
    DeallocationInconsistency,
}

/// Report a consistency violation
pub fn report(event: CriticalEvent, message: impl AsRef<str>) {
    REPORTED.fetch_add(1, Ordering::Relaxed);
    error!("CRITICAL {}: {}", event, message.as_ref());
}

/// Number of events reported by this process so far
#[must_use]
pub fn reported_count() -> u64 {
    REPORTED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let before = reported_count();
        report(CriticalEvent::DiskNotFound, "disk 'vol0' is gone");
        assert!(reported_count() > before);
    }
}
