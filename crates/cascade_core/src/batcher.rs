//! Write batching: coalesces puts and deletes into time- and
//! size-bounded atomic batches.
//!
//! Each class owns one batcher. An open batch lingers for a short
//! interval (default 20 ms) collecting operations, with last-write-wins
//! per key; it flushes early past the operation or byte caps. Flushes
//! serialize: a batch only reaches the engine after its predecessor's
//! completion resolves, and every flushed batch atomically carries the
//! class's last-version watermark at `[0x01, 0x02]`.
//!
//! A failed flush is logged and reported through the db-failure signal,
//! but its completion still resolves so callers are never wedged.

use crate::completion::{Completion, CompletionHandle};
use crate::config::StoreConfig;
use crate::entity::LAST_VERSION_KEY;
use crate::version::VersionSource;
use cascade_kv::{BatchOp, KvTable};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, warn};

/// Callback invoked when a batch fails to reach the engine.
pub type DbFailureCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingValue {
    Put(Vec<u8>),
    Del,
}

struct OpenBatch {
    id: u64,
    ops: BTreeMap<Vec<u8>, PendingValue>,
    value_bytes: usize,
    /// Max version across this batch's own operations; the watermark
    /// this batch commits must cover exactly these rows, never rows
    /// still sitting in a newer open batch.
    max_version: u64,
    completion: Completion,
    handle: CompletionHandle,
    prev: CompletionHandle,
}

struct InflightBatch {
    ops: BTreeMap<Vec<u8>, PendingValue>,
}

struct BatcherState {
    current: Option<OpenBatch>,
    inflight: VecDeque<Arc<InflightBatch>>,
    tail: CompletionHandle,
    next_id: u64,
}

/// Per-class write batcher.
pub struct WriteBatcher {
    table: Arc<dyn KvTable>,
    versions: Arc<VersionSource>,
    linger: std::time::Duration,
    max_ops: usize,
    max_bytes: usize,
    last_version: AtomicU64,
    /// Highest watermark committed to the engine so far. Only flush
    /// threads advance it, after their batch lands.
    durable_version: AtomicU64,
    state: Mutex<BatcherState>,
    failure_callbacks: Mutex<Vec<DbFailureCallback>>,
}

impl WriteBatcher {
    /// Creates a batcher writing to `table`.
    #[must_use]
    pub fn new(
        table: Arc<dyn KvTable>,
        versions: Arc<VersionSource>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            table,
            versions,
            linger: config.batch_linger,
            max_ops: config.batch_max_ops,
            max_bytes: config.batch_max_bytes,
            last_version: AtomicU64::new(0),
            durable_version: AtomicU64::new(0),
            state: Mutex::new(BatcherState {
                current: None,
                inflight: VecDeque::new(),
                tail: CompletionHandle::resolved(),
                next_id: 1,
            }),
            failure_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues a put. Returns the handle that resolves when the batch
    /// holding this operation is durable.
    pub fn put(
        self: &Arc<Self>,
        key: Vec<u8>,
        value: Vec<u8>,
        version: u64,
    ) -> CompletionHandle {
        self.enqueue(key, PendingValue::Put(value), version)
    }

    /// Enqueues a delete.
    pub fn delete(self: &Arc<Self>, key: Vec<u8>, version: u64) -> CompletionHandle {
        self.enqueue(key, PendingValue::Del, version)
    }

    fn enqueue(self: &Arc<Self>, key: Vec<u8>, value: PendingValue, version: u64) -> CompletionHandle {
        self.versions.observe(version);
        self.last_version.fetch_max(version, Ordering::SeqCst);

        let mut state = self.state.lock();
        if state.current.is_none() {
            let id = state.next_id;
            state.next_id += 1;
            let (completion, handle) = Completion::new();
            let prev = state.tail.clone();
            state.tail = handle.clone();
            state.current = Some(OpenBatch {
                id,
                ops: BTreeMap::new(),
                value_bytes: 0,
                max_version: 0,
                completion,
                handle,
                prev,
            });
            self.arm_linger_timer(id);
        }

        let batch = state.current.as_mut().expect("batch opened above");
        if let Some(PendingValue::Put(old)) = batch.ops.get(&key) {
            batch.value_bytes -= old.len();
        }
        if let PendingValue::Put(bytes) = &value {
            batch.value_bytes += bytes.len();
        }
        batch.ops.insert(key, value);
        batch.max_version = batch.max_version.max(version);
        let handle = batch.handle.clone();

        if batch.ops.len() >= self.max_ops || batch.value_bytes > self.max_bytes {
            let batch = state.current.take().expect("current batch present");
            let flushable = Self::stage(&mut state, batch);
            drop(state);
            let batcher = Arc::clone(self);
            thread::spawn(move || batcher.flush(flushable));
        }
        handle
    }

    /// Arms the linger timer for batch `id`; the timer flushes the batch
    /// only if it is still the open one when it fires.
    fn arm_linger_timer(self: &Arc<Self>, id: u64) {
        let batcher = Arc::clone(self);
        let linger = self.linger;
        thread::spawn(move || {
            thread::sleep(linger);
            let flushable = {
                let mut state = batcher.state.lock();
                let still_open = state.current.as_ref().is_some_and(|batch| batch.id == id);
                if still_open {
                    let batch = state.current.take().expect("checked above");
                    Some(Self::stage(&mut state, batch))
                } else {
                    None
                }
            };
            if let Some(flushable) = flushable {
                batcher.flush(flushable);
            }
        });
    }

    /// Moves an open batch into the inflight queue, keeping its
    /// operations visible to pending reads until durable.
    fn stage(state: &mut BatcherState, batch: OpenBatch) -> Flushable {
        let inflight = Arc::new(InflightBatch { ops: batch.ops });
        state.inflight.push_back(Arc::clone(&inflight));
        Flushable {
            inflight,
            max_version: batch.max_version,
            completion: batch.completion,
            prev: batch.prev,
        }
    }

    /// Writes one staged batch to the engine, chained on its
    /// predecessor's completion.
    fn flush(&self, flushable: Flushable) {
        flushable.prev.wait();

        let mut ops: Vec<BatchOp> = flushable
            .inflight
            .ops
            .iter()
            .map(|(key, value)| match value {
                PendingValue::Put(bytes) => BatchOp::Put {
                    key: key.clone(),
                    value: bytes.clone(),
                },
                PendingValue::Del => BatchOp::Del { key: key.clone() },
            })
            .collect();
        // The watermark rides in the same atomic batch and covers only
        // rows this batch (and its durable predecessors) actually
        // carry: the batch's own max version, joined with the watermark
        // already committed, never a version still pending in a newer
        // open batch.
        let watermark = self
            .durable_version
            .load(Ordering::SeqCst)
            .max(flushable.max_version);
        ops.push(BatchOp::Put {
            key: LAST_VERSION_KEY.to_vec(),
            value: watermark.to_string().into_bytes(),
        });

        let result = self.table.batch(ops);
        if result.is_ok() {
            self.durable_version.fetch_max(watermark, Ordering::SeqCst);
        }

        {
            let mut state = self.state.lock();
            state
                .inflight
                .retain(|batch| !Arc::ptr_eq(batch, &flushable.inflight));
        }

        if let Err(err) = result {
            error!(table = self.table.name(), %err, "batch write failed");
            let callbacks: Vec<_> = self.failure_callbacks.lock().iter().cloned().collect();
            let message = err.to_string();
            for callback in callbacks {
                callback(&message);
            }
        }
        // Resolve even on failure so callers are not wedged; durability
        // loss was surfaced through the failure signal.
        flushable.completion.complete();
    }

    /// Reads a key through the pending batches, newest first, before
    /// falling back to the engine.
    ///
    /// Returns `Some(None)` when a pending delete shadows the key.
    pub fn db_get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let state = self.state.lock();
        if let Some(batch) = &state.current {
            if let Some(value) = batch.ops.get(key) {
                return Some(match value {
                    PendingValue::Put(bytes) => Some(bytes.clone()),
                    PendingValue::Del => None,
                });
            }
        }
        for batch in state.inflight.iter().rev() {
            if let Some(value) = batch.ops.get(key) {
                return Some(match value {
                    PendingValue::Put(bytes) => Some(bytes.clone()),
                    PendingValue::Del => None,
                });
            }
        }
        None
    }

    /// Returns the handle of the most recently opened batch; resolved
    /// when everything enqueued so far is durable.
    #[must_use]
    pub fn write_completion(&self) -> CompletionHandle {
        self.state.lock().tail.clone()
    }

    /// Returns the class's last-version watermark.
    #[must_use]
    pub fn last_version(&self) -> u64 {
        self.last_version.load(Ordering::SeqCst)
    }

    /// Raises the watermark floor (used when adopting a persisted
    /// watermark at open).
    pub fn observe_version(&self, version: u64) {
        self.last_version.fetch_max(version, Ordering::SeqCst);
        // The adopted watermark is already on disk; later batches must
        // never commit a smaller one.
        self.durable_version.fetch_max(version, Ordering::SeqCst);
        self.versions.observe(version);
    }

    /// Registers a callback for failed batch writes.
    pub fn on_db_failure(&self, callback: DbFailureCallback) {
        self.failure_callbacks.lock().push(callback);
    }

    /// Flushes the open batch, if any, and waits until every batch
    /// enqueued so far is durable.
    pub fn flush_and_wait(self: &Arc<Self>) {
        let flushable = {
            let mut state = self.state.lock();
            state
                .current
                .take()
                .map(|batch| Self::stage(&mut state, batch))
        };
        if let Some(flushable) = flushable {
            self.flush(flushable);
        }
        let tail = self.write_completion();
        tail.wait();
    }
}

impl Drop for WriteBatcher {
    fn drop(&mut self) {
        let state = self.state.lock();
        if state.current.is_some() || !state.inflight.is_empty() {
            warn!(
                table = self.table.name(),
                "batcher dropped with unflushed writes"
            );
        }
    }
}

struct Flushable {
    inflight: Arc<InflightBatch>,
    max_version: u64,
    completion: Completion,
    prev: CompletionHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_kv::{KvEngine, KvError, KvResult, MemoryEngine, ScanRange};
    use std::time::Duration;

    fn setup(linger: Duration) -> (MemoryEngine, Arc<WriteBatcher>) {
        let engine = MemoryEngine::new();
        let table = engine.open("t").unwrap();
        let versions = Arc::new(VersionSource::new());
        let config = StoreConfig::new().batch_linger(linger);
        let batcher = Arc::new(WriteBatcher::new(table, versions, &config));
        (engine, batcher)
    }

    #[test]
    fn coalesces_writes_into_one_batch() {
        let (engine, batcher) = setup(Duration::from_millis(50));
        let h1 = batcher.put(vec![2, 1], b"a".to_vec(), 1);
        let h2 = batcher.put(vec![2, 2], b"b".to_vec(), 2);
        h1.wait();
        h2.wait();
        assert_eq!(engine.batch_count(), 1);
    }

    #[test]
    fn last_write_wins_within_a_batch() {
        let (engine, batcher) = setup(Duration::from_millis(50));
        batcher.put(vec![2, 1], b"old".to_vec(), 1);
        let handle = batcher.put(vec![2, 1], b"new".to_vec(), 2);
        handle.wait();
        let table = engine.open("t").unwrap();
        assert_eq!(table.get(&[2, 1]).unwrap(), Some(b"new".to_vec()));
        assert_eq!(engine.batch_count(), 1);
    }

    #[test]
    fn watermark_rides_in_same_batch() {
        let (engine, batcher) = setup(Duration::from_millis(50));
        let handle = batcher.put(vec![2, 1], b"a".to_vec(), 41);
        batcher.put(vec![2, 2], b"b".to_vec(), 7);
        handle.wait();
        let table = engine.open("t").unwrap();
        // True max over all ops, not the last enqueued.
        assert_eq!(
            table.get(&LAST_VERSION_KEY).unwrap(),
            Some(b"41".to_vec())
        );
    }

    #[test]
    fn op_cap_splits_batches() {
        let (engine, batcher) = setup(Duration::from_millis(50));
        let mut handles = Vec::new();
        for i in 0..250u32 {
            let key = [vec![2], i.to_be_bytes().to_vec()].concat();
            handles.push(batcher.put(key, b"v".to_vec(), u64::from(i) + 1));
        }
        for handle in handles {
            handle.wait();
        }
        assert_eq!(engine.batch_count(), 3);
        let table = engine.open("t").unwrap();
        let rows = table
            .scan(&ScanRange::all().gt(vec![2]))
            .unwrap();
        assert_eq!(rows.len(), 250);
    }

    #[test]
    fn flushed_watermark_never_covers_a_newer_open_batch() {
        let engine = MemoryEngine::new();
        let table = engine.open("t").unwrap();
        let versions = Arc::new(VersionSource::new());
        let config = StoreConfig::new()
            .batch_linger(Duration::from_secs(10))
            .batch_max_ops(2);
        let batcher = Arc::new(WriteBatcher::new(table, versions, &config));

        // Two ops hit the cap and flush; the third lands in a fresh
        // open batch whose version must not leak into the first
        // batch's watermark, even though it was enqueued before the
        // first batch reached the engine.
        let first = batcher.put(vec![2, 1], b"a".to_vec(), 10);
        batcher.put(vec![2, 2], b"b".to_vec(), 11);
        batcher.put(vec![2, 3], b"c".to_vec(), 99);
        first.wait();

        let batches = engine.batches_for("t");
        let watermark = batches[0]
            .iter()
            .find_map(|op| match op {
                BatchOp::Put { key, value } if key == &LAST_VERSION_KEY.to_vec() => {
                    Some(value.clone())
                }
                _ => None,
            })
            .expect("first batch carries a watermark");
        assert_eq!(watermark, b"11".to_vec());

        batcher.flush_and_wait();
        let batches = engine.batches_for("t");
        let watermark = batches[1]
            .iter()
            .find_map(|op| match op {
                BatchOp::Put { key, value } if key == &LAST_VERSION_KEY.to_vec() => {
                    Some(value.clone())
                }
                _ => None,
            })
            .expect("second batch carries a watermark");
        assert_eq!(watermark, b"99".to_vec());
    }

    #[test]
    fn db_get_sees_pending_writes() {
        let (_engine, batcher) = setup(Duration::from_secs(10));
        batcher.put(vec![2, 1], b"pending".to_vec(), 1);
        assert_eq!(batcher.db_get(&[2, 1]), Some(Some(b"pending".to_vec())));
        batcher.delete(vec![2, 1], 2);
        assert_eq!(batcher.db_get(&[2, 1]), Some(None));
        assert_eq!(batcher.db_get(&[2, 9]), None);
        batcher.flush_and_wait();
    }

    struct FailingTable;

    impl KvTable for FailingTable {
        fn name(&self) -> &str {
            "failing"
        }
        fn get(&self, _key: &[u8]) -> KvResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn put(&self, _key: &[u8], _value: &[u8]) -> KvResult<()> {
            Ok(())
        }
        fn remove_sync(&self, _key: &[u8]) -> KvResult<()> {
            Ok(())
        }
        fn batch(&self, _ops: Vec<BatchOp>) -> KvResult<()> {
            Err(KvError::corrupt("injected failure"))
        }
        fn scan(&self, _range: &ScanRange) -> KvResult<Vec<cascade_kv::KvEntry>> {
            Ok(Vec::new())
        }
        fn clear(&self) -> KvResult<()> {
            Ok(())
        }
        fn wait_for_all_writes(&self) -> KvResult<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_batch_resolves_and_signals() {
        let versions = Arc::new(VersionSource::new());
        let config = StoreConfig::new().batch_linger(Duration::from_millis(1));
        let batcher = Arc::new(WriteBatcher::new(
            Arc::new(FailingTable),
            versions,
            &config,
        ));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);
        batcher.on_db_failure(Arc::new(move |message: &str| {
            seen.lock().push(message.to_string());
        }));

        let handle = batcher.put(vec![2, 1], b"v".to_vec(), 1);
        handle.wait();
        assert_eq!(failures.lock().len(), 1);
    }
}
