//! Incremental indexes over entity classes.
//!
//! An index is bound to exactly one source class. Source updates enqueue
//! per-id requests; a background pass diffs the old and new key sets of
//! each entry, batches the resulting puts and deletes, persists indexing
//! progress, and republishes updates to downstream consumers.
//!
//! Index rows live at `ordered(index_key) ++ 0x1E ++ ordered(source_id)`
//! with the JSON of the attached value (or empty). The reserved
//! `[0x01, 0x02]` row carries the last indexed source version.
//!
//! # Invariants
//!
//! - The persisted progress never exceeds the version of any still
//!   queued request
//! - One poisoned entry never stops the queue
//! - A downstream consumer sees an index update only after the entries
//!   it covers are committed

mod worker;

use crate::class::EntityClass;
use crate::completion::CompletionHandle;
use crate::config::StoreConfig;
use crate::entity::EntityId;
use crate::error::StoreResult;
use crate::events::{ListenerSet, Origin, UpdateEvent, UpdateKind, UpdateListener};
use crate::version::VersionSource;
use cascade_codec::{decode_composite, encode_key, prefix_upper_bound, Key};
use cascade_kv::{BatchOp, KvTable, ScanRange};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use tracing::warn;

pub(crate) use worker::Completionish;

/// One `{key, value}` pair produced by an index function.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEmission {
    /// The index key.
    pub key: Key,
    /// Value attached to the key; `None` stores an empty row and reads
    /// back as the source id.
    pub value: Option<serde_json::Value>,
}

impl IndexEmission {
    /// An emission with no attached value.
    #[must_use]
    pub fn key_only(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// An emission carrying a value.
    #[must_use]
    pub fn with_value(key: impl Into<Key>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }
}

/// A pure function from an entity value to its index emissions; used
/// symmetrically for insertion and removal.
pub type IndexByFn = Arc<dyn Fn(&serde_json::Value) -> Vec<IndexEmission> + Send + Sync>;

/// One entry read back from an index key.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEntry {
    /// Id of the source entity that produced the entry.
    pub source_id: EntityId,
    /// The attached value, when one was stored.
    pub value: Option<serde_json::Value>,
}

/// Lifecycle of an index's work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    /// Work is queued but processing has not started.
    Pending,
    /// A pass is running.
    Processing,
    /// The queue drained; final progress not yet persisted.
    Processed,
    /// Nothing to do.
    Ready,
}

/// One queued unit of indexing work.
#[derive(Debug, Clone)]
pub(crate) struct IndexRequest {
    pub version: u64,
    /// Serialized previous value, captured on first enqueue only.
    pub previous: Option<Option<String>>,
    pub deleted: bool,
    pub origins: BTreeSet<Origin>,
}

pub(crate) struct IndexState {
    pub phase: IndexPhase,
    pub order: VecDeque<EntityId>,
    pub queue: HashMap<EntityId, IndexRequest>,
    /// Pending index table operations not yet flushed.
    pub operations: Vec<BatchOp>,
    /// Encoded index keys touched since the last commit, with the
    /// decoded key and accumulated origins.
    pub updated_keys: BTreeMap<Vec<u8>, (Key, BTreeSet<Origin>)>,
    pub last_indexed_version: u64,
    /// Progress value staged for the next committed batch.
    pub queued_progress: Option<u64>,
    /// Resolver and handle for the current processing cycle.
    pub processing: Option<Completionish>,
    /// Whether a delayed pass is already scheduled.
    pub scheduled: bool,
    /// Downstream handles the next readability wait must cover.
    pub fully_readable: Vec<CompletionHandle>,
}

/// An incremental index bound to one source class.
pub struct IndexClass {
    pub(crate) name: String,
    pub(crate) table: Arc<dyn KvTable>,
    pub(crate) source: Arc<EntityClass>,
    pub(crate) index_by: IndexByFn,
    pub(crate) versions: Arc<VersionSource>,
    pub(crate) config: StoreConfig,
    pub(crate) listeners: ListenerSet,
    pub(crate) cancel: AtomicBool,
    pub(crate) state: Mutex<IndexState>,
    /// Back-reference so listener callbacks can hand the index to its
    /// worker threads.
    pub(crate) self_ref: Weak<IndexClass>,
}

impl IndexClass {
    /// Creates an index over `source`, writing to `table`.
    ///
    /// The source is reconfigured to carry previous values with its
    /// updates so deletions can be diffed. Call
    /// [`IndexClass::resume`] afterwards to build or catch up.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        table: Arc<dyn KvTable>,
        source: Arc<EntityClass>,
        index_by: IndexByFn,
    ) -> Arc<Self> {
        source.set_track_previous();
        let versions = Arc::clone(source.versions());
        let config = source.config().clone();
        let name = name.into();
        Arc::new_cyclic(|self_ref| Self {
            name,
            table,
            source,
            index_by,
            versions,
            config,
            listeners: ListenerSet::new(),
            cancel: AtomicBool::new(false),
            state: Mutex::new(IndexState {
                phase: IndexPhase::Ready,
                order: VecDeque::new(),
                queue: HashMap::new(),
                operations: Vec::new(),
                updated_keys: BTreeMap::new(),
                last_indexed_version: 0,
                queued_progress: None,
                processing: None,
                scheduled: false,
                fully_readable: Vec::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Returns the index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the source class.
    #[must_use]
    pub fn source(&self) -> &Arc<EntityClass> {
        &self.source
    }

    /// Returns the current queue phase.
    #[must_use]
    pub fn phase(&self) -> IndexPhase {
        self.state.lock().phase
    }

    /// Returns the last indexed source version.
    #[must_use]
    pub fn last_indexed_version(&self) -> u64 {
        self.state.lock().last_indexed_version
    }

    /// Resolves when the current processing cycle completes; resolved
    /// when the index is idle.
    #[must_use]
    pub fn when_processing_complete(&self) -> CompletionHandle {
        self.state
            .lock()
            .processing
            .as_ref()
            .map_or_else(CompletionHandle::resolved, |p| p.handle.clone())
    }

    /// Waits until every downstream consumer of already-committed
    /// updates is readable.
    pub fn wait_fully_readable(&self) {
        loop {
            let handles: Vec<CompletionHandle> =
                std::mem::take(&mut self.state.lock().fully_readable);
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                handle.wait();
            }
        }
    }

    /// Registers a downstream listener for index-key updates.
    pub fn notifies(&self, listener: Arc<dyn UpdateListener>) {
        self.listeners.notifies(listener);
    }

    /// Deregisters a downstream listener.
    pub fn stop_notifies(&self, listener: &Arc<dyn UpdateListener>) {
        self.listeners.stop_notifies(listener);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Returns the entries stored under one index key, in source-id
    /// order.
    pub fn entries_for(&self, key: &Key) -> StoreResult<Vec<IndexedEntry>> {
        self.table.wait_for_all_writes()?;
        let prefix = encode_key(key)?;
        let upper = prefix_upper_bound(&prefix);
        let entries = self
            .table
            .scan(&ScanRange::all().gt(prefix).lt(upper))?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let parts = decode_composite(&entry.key)?;
            let Some(source_part) = parts.get(1) else {
                warn!(index = %self.name, "index row key has no source id");
                continue;
            };
            let source_id = EntityId::from_key(source_part)?;
            let value = if entry.value.is_empty() {
                None
            } else {
                Some(serde_json::from_slice(&entry.value)?)
            };
            results.push(IndexedEntry { source_id, value });
        }
        Ok(results)
    }

    /// Returns the parsed values under one index key; entries stored
    /// without a value yield their source id.
    pub fn values_for(&self, key: &Key) -> StoreResult<Vec<serde_json::Value>> {
        Ok(self
            .entries_for(key)?
            .into_iter()
            .map(|entry| {
                entry.value.unwrap_or_else(|| match &entry.source_id {
                    EntityId::Num(n) => serde_json::json!(n),
                    EntityId::Text(s) => serde_json::json!(s),
                })
            })
            .collect())
    }

    /// Returns the distinct index keys in order, optionally bounded.
    ///
    /// Adjacent equal decoded keys deduplicate during the scan; the
    /// engine's write barrier runs first so a caller sees its own
    /// writes.
    pub fn index_keys(
        &self,
        start: Option<&Key>,
        end: Option<&Key>,
    ) -> StoreResult<Vec<Key>> {
        self.table.wait_for_all_writes()?;
        let mut range = ScanRange::all().keys_only();
        range = match start {
            Some(start) => range.gte(encode_key(start)?),
            None => range.gt(crate::entity::ENTITY_RANGE_START.to_vec()),
        };
        if let Some(end) = end {
            range = range.lt(prefix_upper_bound(&encode_key(end)?));
        }

        let mut keys: Vec<Key> = Vec::new();
        for entry in self.table.scan(&range)? {
            let parts = decode_composite(&entry.key)?;
            let Some(first) = parts.first() else { continue };
            if keys.last() != Some(first) {
                keys.push(first.clone());
            }
        }
        Ok(keys)
    }
}

/// Source updates enqueue indexing work.
impl UpdateListener for IndexClass {
    fn on_update(&self, event: &mut UpdateEvent) {
        let id = match EntityId::from_key(&event.subject) {
            Ok(id) => id,
            Err(err) => {
                warn!(index = %self.name, %err, "unusable update subject");
                return;
            }
        };
        let version = event
            .version
            .unwrap_or_else(|| self.versions.next());

        let mut state = self.state.lock();
        let existed = state.queue.contains_key(&id);
        if existed {
            // Re-insert at the tail so queue order reflects the latest
            // event version.
            state.order.retain(|queued| queued != &id);
        }
        state.order.push_back(id.clone());

        let previous = event.previous.clone();
        let request = state.queue.entry(id).or_insert_with(|| IndexRequest {
            version,
            previous,
            deleted: false,
            origins: BTreeSet::new(),
        });
        request.version = version;
        request.deleted = event.kind == UpdateKind::Deleted;
        request.origins.extend(event.origins.iter().cloned());

        let handle = worker::ensure_processing_handle(&mut state);
        event.updates_in_progress.push(handle);

        if !existed && !state.scheduled && state.phase != IndexPhase::Processing {
            state.scheduled = true;
            drop(state);
            // Niceness: let nearby updates coalesce before the pass.
            self.schedule_after(self.config.niceness);
        }
    }
}

impl std::fmt::Debug for IndexClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IndexClass")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("phase", &state.phase)
            .field("queued", &state.queue.len())
            .field("last_indexed_version", &state.last_indexed_version)
            .finish_non_exhaustive()
    }
}

/// Builds the composite row key for `(index_key, source_id)`.
pub(crate) fn composite_row_key(
    encoded_index_key: &[u8],
    id: &EntityId,
) -> StoreResult<Vec<u8>> {
    let mut key = Vec::with_capacity(encoded_index_key.len() + 10);
    key.extend_from_slice(encoded_index_key);
    key.push(cascade_codec::COMPOSITE_SEPARATOR);
    key.extend_from_slice(&encode_key(&id.to_key())?);
    Ok(key)
}
