//! Index queue processing, batched commits, and startup resume.

use super::{composite_row_key, IndexClass, IndexPhase, IndexRequest, IndexState};
use crate::class::ValueOutcome;
use crate::completion::{Completion, CompletionHandle};
use crate::context::Context;
use crate::entity::{EntityId, ENTITY_RANGE_START, LAST_VERSION_KEY};
use crate::error::StoreResult;
use crate::events::{Origin, UpdateEvent, UpdateKind};
use cascade_codec::{decode_composite, encode_key, Key};
use cascade_kv::{BatchOp, KvTable, ScanRange};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Resolver/handle pair for one processing cycle.
pub(crate) struct Completionish {
    pub completion: Completion,
    pub handle: CompletionHandle,
}

/// Returns the handle for the current processing cycle, creating the
/// cycle if the index was idle.
pub(crate) fn ensure_processing_handle(state: &mut IndexState) -> CompletionHandle {
    if let Some(processing) = &state.processing {
        return processing.handle.clone();
    }
    let (completion, handle) = Completion::new();
    state.processing = Some(Completionish {
        completion,
        handle: handle.clone(),
    });
    handle
}

/// Result of indexing one entry, merged into shared state afterwards.
struct IndexOneResult {
    ops: Vec<BatchOp>,
    updated: Vec<(Vec<u8>, Key, BTreeSet<Origin>)>,
    version: u64,
}

impl IndexClass {
    /// Spawns a processing pass after `delay`.
    pub(crate) fn schedule_after(&self, delay: Duration) {
        let Some(index) = self.self_ref.upgrade() else {
            return;
        };
        thread::spawn(move || {
            thread::sleep(delay);
            index.process_queue();
        });
    }

    /// Runs the queue until it drains (or cancellation).
    ///
    /// At most one pass runs at a time; concurrent calls return
    /// immediately.
    pub fn process_queue(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, IndexPhase::Processing | IndexPhase::Processed) {
                state.scheduled = false;
                return;
            }
            state.phase = IndexPhase::Processing;
            state.scheduled = false;
            ensure_processing_handle(&mut state);
        }
        // An index sees its source's updates only after the source's own
        // processing completes.
        self.source.when_processing_complete().wait();

        let max = self.config.index_concurrency.max(1);
        let mut processed_in_pass = 0usize;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                self.finish_cancelled();
                return;
            }

            let chunk: Vec<(EntityId, IndexRequest)> = {
                let mut state = self.state.lock();
                let take = state.order.len().min(max);
                let mut chunk = Vec::with_capacity(take);
                for _ in 0..take {
                    let Some(id) = state.order.pop_front() else {
                        break;
                    };
                    if let Some(request) = state.queue.remove(&id) {
                        chunk.push((id, request));
                    }
                }
                chunk
            };

            if chunk.is_empty() {
                self.finish_drained();
                let mut state = self.state.lock();
                if state.order.is_empty() {
                    state.phase = IndexPhase::Ready;
                    if let Some(processing) = state.processing.take() {
                        processing.completion.complete();
                    }
                    return;
                }
                // New work arrived during the final commit; keep going.
                state.phase = IndexPhase::Processing;
                continue;
            }

            let results: Vec<IndexOneResult> = thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|(id, request)| scope.spawn(move || self.index_one(id, request)))
                    .collect();
                handles
                    .into_iter()
                    .filter_map(|handle| handle.join().ok().flatten())
                    .collect()
            });

            {
                let mut state = self.state.lock();
                for result in results {
                    state.operations.extend(result.ops);
                    for (encoded, key, origins) in result.updated {
                        let entry = state
                            .updated_keys
                            .entry(encoded)
                            .or_insert_with(|| (key, BTreeSet::new()));
                        entry.1.extend(origins);
                    }
                    state.last_indexed_version =
                        state.last_indexed_version.max(result.version);
                }
            }

            processed_in_pass += chunk.len();
            if processed_in_pass >= 2 * max {
                self.commit_operations();
                thread::sleep(self.config.niceness);
                processed_in_pass = 0;
            }
        }
    }

    /// Final commit after the queue drains: flush operations, wait for
    /// downstream to be readable, then persist the indexing progress.
    fn finish_drained(self: &Arc<Self>) {
        self.state.lock().phase = IndexPhase::Processed;
        self.commit_operations();
        self.wait_fully_readable();
        let progress = {
            let mut state = self.state.lock();
            state
                .queued_progress
                .take()
                .unwrap_or(state.last_indexed_version)
        };
        if let Err(err) = self
            .table
            .put(&LAST_VERSION_KEY, progress.to_string().as_bytes())
        {
            error!(index = %self.name, %err, "failed to persist indexing progress");
        }
        debug!(index = %self.name, progress, "index pass complete");
    }

    fn finish_cancelled(&self) {
        let mut state = self.state.lock();
        state.operations.clear();
        state.updated_keys.clear();
        state.phase = IndexPhase::Pending;
        if let Some(processing) = state.processing.take() {
            processing.completion.complete();
        }
    }

    /// Flushes pending index operations as one atomic batch.
    ///
    /// Progress is capped below the version of the oldest still-queued
    /// request, so a crash can never record progress past unindexed
    /// work. The previously staged progress rides in this batch; the
    /// new one is staged only after downstream fan-out.
    pub(crate) fn commit_operations(&self) {
        let (ops, updated, progress) = {
            let mut state = self.state.lock();
            let progress = match state.order.front().and_then(|id| state.queue.get(id)) {
                Some(first) => state.last_indexed_version.min(first.version.saturating_sub(1)),
                None => state.last_indexed_version,
            };
            if state.operations.is_empty() {
                state.queued_progress = Some(progress);
                return;
            }
            let mut ops = std::mem::take(&mut state.operations);
            if let Some(queued) = state.queued_progress.take() {
                ops.push(BatchOp::Put {
                    key: LAST_VERSION_KEY.to_vec(),
                    value: queued.to_string().into_bytes(),
                });
            }
            (ops, std::mem::take(&mut state.updated_keys), progress)
        };

        if let Err(err) = self.table.batch(ops) {
            // Absorbed: the queue stays live and progress is not
            // advanced past the failed batch.
            error!(index = %self.name, %err, "index batch failed");
            return;
        }

        let mut collected = Vec::new();
        for (_encoded, (key, origins)) in updated {
            let mut event = UpdateEvent::new(UpdateKind::Replaced, self.name.clone(), key);
            event.origins.extend(origins);
            self.listeners.emit(&mut event);
            collected.append(&mut event.updates_in_progress);
        }

        let mut state = self.state.lock();
        state.fully_readable.extend(collected);
        state.queued_progress = Some(progress);
    }

    /// Indexes one entry; failures are logged and skipped so a poisoned
    /// entry never stops the queue.
    fn index_one(&self, id: &EntityId, request: &IndexRequest) -> Option<IndexOneResult> {
        match self.try_index_one(id, request) {
            Ok(result) => Some(result),
            Err(err) => {
                error!(index = %self.name, %id, %err, "indexing entry failed");
                None
            }
        }
    }

    fn try_index_one(
        &self,
        id: &EntityId,
        request: &IndexRequest,
    ) -> StoreResult<IndexOneResult> {
        // Entries produced by the previous value are removal candidates
        // until the new value re-emits them unchanged.
        let mut to_remove: BTreeMap<Vec<u8>, (Key, String)> = BTreeMap::new();
        if let Some(Some(previous_json)) = &request.previous {
            match serde_json::from_str::<serde_json::Value>(previous_json) {
                Ok(previous) => {
                    for emission in (self.index_by)(&previous) {
                        let encoded = encode_key(&emission.key)?;
                        let value_json = emission_value_json(emission.value.as_ref())?;
                        to_remove.insert(encoded, (emission.key, value_json));
                    }
                }
                Err(err) => {
                    warn!(index = %self.name, %id, %err, "unparseable previous value");
                }
            }
        }

        let mut ops = Vec::new();
        let mut updated = Vec::new();

        if !request.deleted {
            if let Some(value) = self.load_source_value(id)? {
                for emission in (self.index_by)(&value) {
                    let encoded = encode_key(&emission.key)?;
                    let value_json = emission_value_json(emission.value.as_ref())?;
                    if to_remove
                        .get(&encoded)
                        .is_some_and(|(_, old)| *old == value_json)
                    {
                        // Unchanged entry: neither rewritten nor removed.
                        to_remove.remove(&encoded);
                        continue;
                    }
                    ops.push(BatchOp::Put {
                        key: composite_row_key(&encoded, id)?,
                        value: value_json.into_bytes(),
                    });
                    to_remove.remove(&encoded);
                    updated.push((encoded, emission.key, request.origins.clone()));
                }
            }
        }

        for (encoded, (key, _)) in to_remove {
            ops.push(BatchOp::Del {
                key: composite_row_key(&encoded, id)?,
            });
            updated.push((encoded, key, request.origins.clone()));
        }

        Ok(IndexOneResult {
            ops,
            updated,
            version: request.version,
        })
    }

    /// Loads the source entity's current value, retrying once.
    fn load_source_value(&self, id: &EntityId) -> StoreResult<Option<serde_json::Value>> {
        let outcome = match self.source.value_of(id, &Context::new()) {
            Ok(outcome) => outcome,
            Err(first) => {
                warn!(index = %self.name, %id, %first, "source load failed, retrying");
                match self.source.value_of(id, &Context::new()) {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(first),
                }
            }
        };
        Ok(match outcome {
            ValueOutcome::Value(value) => Some(value),
            ValueOutcome::Absent | ValueOutcome::NotModified => None,
        })
    }

    // ------------------------------------------------------------------
    // Startup and rebuild
    // ------------------------------------------------------------------

    /// Resumes indexing after open.
    ///
    /// A zero (or missing) watermark clears the table and rebuilds from
    /// scratch; otherwise stale rows for sources updated past the
    /// watermark are removed synchronously and one initialization-tagged
    /// request per changed id is enqueued.
    pub fn resume(self: &Arc<Self>) -> StoreResult<()> {
        let stored = self
            .table
            .get(&LAST_VERSION_KEY)?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| text.parse::<u64>().ok())
            .unwrap_or(0);

        if stored == 0 {
            self.table.clear()?;
            self.state.lock().last_indexed_version = 0;
            let all = self.source.get_instance_ids_and_versions_since(0)?;
            debug!(index = %self.name, entries = all.len(), "full index build");
            self.enqueue_initialization(all);
            return Ok(());
        }

        self.versions.observe(stored);
        self.state.lock().last_indexed_version = stored;
        let since = self.source.get_instance_ids_and_versions_since(stored)?;
        if since.is_empty() {
            return Ok(());
        }

        let stale: HashSet<&EntityId> = since.iter().map(|(id, _)| id).collect();
        for entry in self
            .table
            .scan(&ScanRange::all().keys_only().gt(ENTITY_RANGE_START.to_vec()))?
        {
            let Ok(parts) = decode_composite(&entry.key) else {
                continue;
            };
            let Some(source_part) = parts.get(1) else {
                continue;
            };
            let Ok(source_id) = EntityId::from_key(source_part) else {
                continue;
            };
            if stale.contains(&source_id) {
                self.table.remove_sync(&entry.key)?;
            }
        }
        debug!(index = %self.name, entries = since.len(), "index catch-up");
        self.enqueue_initialization(since);
        Ok(())
    }

    /// Rebuilds the index from scratch: cancels the current pass, clears
    /// the table, zeroes the watermark, and resumes (which becomes a
    /// full build).
    pub fn rebuild(self: &Arc<Self>) -> StoreResult<()> {
        self.cancel.store(true, Ordering::SeqCst);
        self.when_processing_complete().wait();
        self.cancel.store(false, Ordering::SeqCst);

        {
            let mut state = self.state.lock();
            state.order.clear();
            state.queue.clear();
            state.operations.clear();
            state.updated_keys.clear();
            state.queued_progress = None;
            state.last_indexed_version = 0;
            state.fully_readable.clear();
            state.phase = IndexPhase::Ready;
        }
        self.table.clear()?;
        self.resume()
    }

    fn enqueue_initialization(&self, entries: Vec<(EntityId, u64)>) {
        for (id, version) in entries {
            let mut event =
                UpdateEvent::new(UpdateKind::Replaced, self.source.name(), id.to_key())
                    .with_version(version)
                    .from_initialization();
            crate::events::UpdateListener::on_update(self, &mut event);
        }
    }

    /// Blocks until the index is idle and downstream is readable; test
    /// and shutdown convenience.
    pub fn drain(&self) {
        loop {
            let (idle, handle) = {
                let state = self.state.lock();
                let idle = state.queue.is_empty()
                    && !state.scheduled
                    && state.phase == IndexPhase::Ready
                    && state.processing.is_none();
                (
                    idle,
                    state.processing.as_ref().map(|p| p.handle.clone()),
                )
            };
            if idle {
                self.wait_fully_readable();
                let state = self.state.lock();
                if state.queue.is_empty() && !state.scheduled && state.processing.is_none() {
                    return;
                }
                continue;
            }
            match handle {
                Some(handle) => handle.wait(),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

fn emission_value_json(value: Option<&serde_json::Value>) -> StoreResult<String> {
    Ok(match value {
        Some(value) => serde_json::to_string(value)?,
        None => String::new(),
    })
}
