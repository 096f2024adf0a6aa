//! Process-wide version sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A monotonic version sequence shared by every class in one store.
///
/// Seeded from the wall clock (unix epoch milliseconds) so versions from
/// separate process lifetimes stay ordered, then strictly increasing
/// within the process. Versions allocated here are unique across all
/// entities of the store.
#[derive(Debug)]
pub struct VersionSource {
    next: AtomicU64,
}

impl VersionSource {
    /// Creates a sequence seeded from the current wall clock.
    #[must_use]
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            next: AtomicU64::new(now),
        }
    }

    /// Returns the next version, strictly greater than every version
    /// previously returned or observed.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advances the floor so later allocations exceed `version`.
    ///
    /// Used when a persisted or event-carried version enters the
    /// process, so the sequence never hands out a stale value.
    pub fn observe(&self, version: u64) {
        self.next.fetch_max(version, Ordering::SeqCst);
    }

    /// Returns the most recently allocated or observed version.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for VersionSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing() {
        let versions = VersionSource::new();
        let a = versions.next();
        let b = versions.next();
        assert!(b > a);
    }

    #[test]
    fn observe_advances_floor() {
        let versions = VersionSource::new();
        let far_future = versions.current() + 1_000_000;
        versions.observe(far_future);
        assert!(versions.next() > far_future);
    }

    #[test]
    fn observe_never_regresses() {
        let versions = VersionSource::new();
        let a = versions.next();
        versions.observe(0);
        assert!(versions.next() > a);
    }
}
