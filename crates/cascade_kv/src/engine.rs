//! Engine and table traits.

use crate::error::KvResult;
use std::ops::Bound;
use std::sync::Arc;

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Write `value` at `key`, replacing any existing value.
    Put {
        /// Row key.
        key: Vec<u8>,
        /// Row value.
        value: Vec<u8>,
    },
    /// Remove the row at `key` if present.
    Del {
        /// Row key.
        key: Vec<u8>,
    },
}

impl BatchOp {
    /// Returns the key this operation targets.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Del { key } => key,
        }
    }
}

/// One entry yielded by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Row key.
    pub key: Vec<u8>,
    /// Row value; empty when the scan requested keys only.
    pub value: Vec<u8>,
}

/// Key-ordered range bounds for a scan.
///
/// Bounds compose: `gt`/`gte` pick the lower bound, `lt`/`lte` the upper.
/// `values: false` asks the engine to skip materializing values.
#[derive(Debug, Clone, Default)]
pub struct ScanRange {
    /// Exclusive lower bound.
    pub gt: Option<Vec<u8>>,
    /// Inclusive lower bound.
    pub gte: Option<Vec<u8>>,
    /// Exclusive upper bound.
    pub lt: Option<Vec<u8>>,
    /// Inclusive upper bound.
    pub lte: Option<Vec<u8>>,
    /// Whether to materialize values.
    pub values: bool,
}

impl ScanRange {
    /// Creates an unbounded scan that materializes values.
    #[must_use]
    pub fn all() -> Self {
        Self {
            values: true,
            ..Self::default()
        }
    }

    /// Sets an exclusive lower bound.
    #[must_use]
    pub fn gt(mut self, key: Vec<u8>) -> Self {
        self.gt = Some(key);
        self
    }

    /// Sets an inclusive lower bound.
    #[must_use]
    pub fn gte(mut self, key: Vec<u8>) -> Self {
        self.gte = Some(key);
        self
    }

    /// Sets an exclusive upper bound.
    #[must_use]
    pub fn lt(mut self, key: Vec<u8>) -> Self {
        self.lt = Some(key);
        self
    }

    /// Sets an inclusive upper bound.
    #[must_use]
    pub fn lte(mut self, key: Vec<u8>) -> Self {
        self.lte = Some(key);
        self
    }

    /// Skips value materialization.
    #[must_use]
    pub fn keys_only(mut self) -> Self {
        self.values = false;
        self
    }

    /// Resolves the effective `(start, end)` bounds.
    #[must_use]
    pub fn bounds(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let start = match (&self.gt, &self.gte) {
            (Some(k), _) => Bound::Excluded(k.clone()),
            (None, Some(k)) => Bound::Included(k.clone()),
            (None, None) => Bound::Unbounded,
        };
        let end = match (&self.lt, &self.lte) {
            (Some(k), _) => Bound::Excluded(k.clone()),
            (None, Some(k)) => Bound::Included(k.clone()),
            (None, None) => Bound::Unbounded,
        };
        (start, end)
    }
}

/// A named, ordered key-value table.
///
/// # Invariants
///
/// - `batch` is all-or-nothing: after a crash, either every operation of
///   a batch is visible or none is
/// - `scan` yields entries in ascending key order
/// - `wait_for_all_writes` returns only once previously accepted writes
///   are visible to subsequent reads
/// - Tables must be safe for concurrent use
pub trait KvTable: Send + Sync {
    /// Returns the table name.
    fn name(&self) -> &str;

    /// Point read.
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    /// Writes a single row.
    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()>;

    /// Removes a single row, synchronously.
    fn remove_sync(&self, key: &[u8]) -> KvResult<()>;

    /// Applies a batch of operations atomically.
    fn batch(&self, ops: Vec<BatchOp>) -> KvResult<()>;

    /// Scans entries within `range` in ascending key order.
    fn scan(&self, range: &ScanRange) -> KvResult<Vec<KvEntry>>;

    /// Removes every row in the table.
    fn clear(&self) -> KvResult<()>;

    /// Blocks until all previously accepted writes are readable.
    fn wait_for_all_writes(&self) -> KvResult<()>;
}

/// A KV engine: a factory for named tables.
pub trait KvEngine: Send + Sync {
    /// Opens (creating if absent) the table with the given name.
    fn open(&self, name: &str) -> KvResult<Arc<dyn KvTable>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_range_bounds() {
        let range = ScanRange::all().gt(vec![2]).lte(vec![9]);
        let (start, end) = range.bounds();
        assert_eq!(start, Bound::Excluded(vec![2]));
        assert_eq!(end, Bound::Included(vec![9]));
    }

    #[test]
    fn batch_op_key() {
        let put = BatchOp::Put {
            key: vec![1],
            value: vec![2],
        };
        let del = BatchOp::Del { key: vec![3] };
        assert_eq!(put.key(), &[1]);
        assert_eq!(del.key(), &[3]);
    }
}
