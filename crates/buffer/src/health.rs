//! Record source health tracking.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info};

/// Health of the record source, as observed by buffer builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Healthy,
    /// The last `failures` builds in a row failed at the source.
    Degraded { failures: u32 },
}

/// Counts consecutive record source failures.
///
/// Only failures attributable to the source count; a failed table write or a
/// timeout says nothing about whether the source is reachable. Any successful
/// source query resets the count.
#[derive(Debug)]
pub struct SourceHealth {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl SourceHealth {
    /// A threshold of zero is treated as one: a single failure degrades.
    pub fn new(threshold: u32) -> Self {
        Self { consecutive_failures: AtomicU32::new(0), threshold: threshold.max(1) }
    }

    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous >= self.threshold {
            info!(failures = previous, "record source recovered");
        }
    }

    /// Returns the status after counting the failure.
    pub fn record_failure(&self) -> SourceStatus {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if failures == self.threshold {
            error!(failures, "record source keeps failing; service is degraded");
        }
        self.status_for(failures)
    }

    pub fn status(&self) -> SourceStatus {
        self.status_for(self.consecutive_failures.load(Ordering::SeqCst))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status(), SourceStatus::Degraded { .. })
    }

    fn status_for(&self, failures: u32) -> SourceStatus {
        match failures >= self.threshold {
            true => SourceStatus::Degraded { failures },
            false => SourceStatus::Healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_at_threshold() {
        let health = SourceHealth::new(3);
        assert_eq!(health.record_failure(), SourceStatus::Healthy);
        assert_eq!(health.record_failure(), SourceStatus::Healthy);
        assert_eq!(health.record_failure(), SourceStatus::Degraded { failures: 3 });
        assert!(health.is_degraded());
    }

    #[test]
    fn test_success_resets() {
        let health = SourceHealth::new(2);
        health.record_failure();
        health.record_failure();
        assert!(health.is_degraded());
        health.record_success();
        assert_eq!(health.status(), SourceStatus::Healthy);
        assert_eq!(health.record_failure(), SourceStatus::Healthy);
    }

    #[test]
    fn test_zero_threshold() {
        let health = SourceHealth::new(0);
        assert!(!health.is_degraded());
        assert!(health.record_failure() != SourceStatus::Healthy);
    }
}
