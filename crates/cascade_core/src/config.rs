//! Store configuration.

use std::time::Duration;

/// Configuration for an object store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long an open write batch lingers before flushing.
    pub batch_linger: Duration,

    /// Maximum operations per write batch before an immediate flush.
    pub batch_max_ops: usize,

    /// Maximum cumulative value bytes per batch before an immediate flush.
    pub batch_max_bytes: usize,

    /// Maximum index entries processed concurrently in one pass.
    pub index_concurrency: usize,

    /// Voluntary sleep between index-processing passes, and the delay
    /// before a freshly scheduled pass starts.
    pub niceness: Duration,

    /// Total weight (bytes) of in-memory cached values before eviction.
    pub cache_capacity: u64,

    /// Maximum loads in flight for a batched multi-id fetch.
    pub fetch_concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_linger: Duration::from_millis(20),
            batch_max_ops: 100,
            batch_max_bytes: 100_000,
            index_concurrency: 15,
            niceness: Duration::from_millis(150),
            cache_capacity: 64 * 1024 * 1024, // 64 MiB
            fetch_concurrency: 100,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch linger interval.
    #[must_use]
    pub const fn batch_linger(mut self, value: Duration) -> Self {
        self.batch_linger = value;
        self
    }

    /// Sets the per-batch operation cap.
    #[must_use]
    pub const fn batch_max_ops(mut self, value: usize) -> Self {
        self.batch_max_ops = value;
        self
    }

    /// Sets the per-batch value byte cap.
    #[must_use]
    pub const fn batch_max_bytes(mut self, value: usize) -> Self {
        self.batch_max_bytes = value;
        self
    }

    /// Sets the index-processing concurrency.
    #[must_use]
    pub const fn index_concurrency(mut self, value: usize) -> Self {
        self.index_concurrency = value;
        self
    }

    /// Sets the scheduling niceness.
    #[must_use]
    pub const fn niceness(mut self, value: Duration) -> Self {
        self.niceness = value;
        self
    }

    /// Sets the cache weight capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, value: u64) -> Self {
        self.cache_capacity = value;
        self
    }

    /// Sets the multi-id fetch concurrency.
    #[must_use]
    pub const fn fetch_concurrency(mut self, value: usize) -> Self {
        self.fetch_concurrency = value;
        self
    }
}
