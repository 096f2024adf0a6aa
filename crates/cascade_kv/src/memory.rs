//! In-memory engine for testing and ephemeral stores.

use crate::engine::{BatchOp, KvEngine, KvEntry, KvTable, ScanRange};
use crate::error::KvResult;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An in-memory KV engine.
///
/// Tables are `BTreeMap`s behind locks. Every applied batch is also
/// recorded in an engine-wide journal in commit order, so tests can
/// rebuild the state a crash would have left behind with
/// [`MemoryEngine::replay_truncated`].
///
/// # Thread Safety
///
/// The engine and its tables are thread-safe and cheap to share.
#[derive(Default)]
pub struct MemoryEngine {
    tables: RwLock<HashMap<String, Arc<MemoryTable>>>,
    journal: Arc<Mutex<Vec<(String, Vec<BatchOp>)>>>,
}

impl MemoryEngine {
    /// Creates a new empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of batches committed across all tables.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.journal.lock().len()
    }

    /// Returns the committed batches of one table, in commit order.
    #[must_use]
    pub fn batches_for(&self, table: &str) -> Vec<Vec<BatchOp>> {
        self.journal
            .lock()
            .iter()
            .filter(|(name, _)| name == table)
            .map(|(_, ops)| ops.clone())
            .collect()
    }

    /// Builds a fresh engine holding only the first `batches` committed
    /// batches, in their original commit order.
    ///
    /// This simulates a crash at a batch boundary: the engine's batches
    /// are atomic, so any prefix of the journal is a state the store
    /// could have been restarted from.
    #[must_use]
    pub fn replay_truncated(&self, batches: usize) -> Self {
        let journal = self.journal.lock();
        let replayed = Self::new();
        for (table_name, ops) in journal.iter().take(batches) {
            let table = replayed
                .open_memory(table_name)
                .expect("memory open is infallible");
            table.apply(ops);
        }
        // The replayed engine starts its own journal from the prefix.
        *replayed.journal.lock() = journal.iter().take(batches).cloned().collect();
        replayed
    }

    fn open_memory(&self, name: &str) -> KvResult<Arc<MemoryTable>> {
        let mut tables = self.tables.write();
        let table = tables
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryTable {
                    name: name.to_string(),
                    rows: RwLock::new(BTreeMap::new()),
                    journal: Arc::clone(&self.journal),
                })
            })
            .clone();
        Ok(table)
    }
}

impl KvEngine for MemoryEngine {
    fn open(&self, name: &str) -> KvResult<Arc<dyn KvTable>> {
        Ok(self.open_memory(name)?)
    }
}

struct MemoryTable {
    name: String,
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    journal: Arc<Mutex<Vec<(String, Vec<BatchOp>)>>>,
}

impl MemoryTable {
    fn apply(&self, ops: &[BatchOp]) {
        let mut rows = self.rows.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    rows.insert(key.clone(), value.clone());
                }
                BatchOp::Del { key } => {
                    rows.remove(key);
                }
            }
        }
    }
}

impl KvTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.rows.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.rows.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove_sync(&self, key: &[u8]) -> KvResult<()> {
        self.rows.write().remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> KvResult<()> {
        // Journal before apply, under the row lock, so journal order
        // matches visibility order.
        let mut rows = self.rows.write();
        self.journal.lock().push((self.name.clone(), ops.clone()));
        for op in &ops {
            match op {
                BatchOp::Put { key, value } => {
                    rows.insert(key.clone(), value.clone());
                }
                BatchOp::Del { key } => {
                    rows.remove(key);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, range: &ScanRange) -> KvResult<Vec<KvEntry>> {
        let (start, end) = range.bounds();
        let rows = self.rows.read();
        Ok(rows
            .range((start, end))
            .map(|(k, v)| KvEntry {
                key: k.clone(),
                value: if range.values { v.clone() } else { Vec::new() },
            })
            .collect())
    }

    fn clear(&self) -> KvResult<()> {
        self.rows.write().clear();
        Ok(())
    }

    fn wait_for_all_writes(&self) -> KvResult<()> {
        // Writes are applied synchronously; nothing is in flight.
        Ok(())
    }
}
