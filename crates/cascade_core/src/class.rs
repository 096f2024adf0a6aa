//! Entity classes: the store layer binding a class of entities to its
//! backing table.
//!
//! A class owns its table, identity map, and write batcher. All
//! mutation funnels through the update protocol so listeners (indexes,
//! derived classes, application code) observe every change exactly once,
//! with previous values captured when any consumer needs them.

use crate::batcher::{DbFailureCallback, WriteBatcher};
use crate::completion::CompletionHandle;
use crate::config::StoreConfig;
use crate::context::Context;
use crate::entity::{
    decode_row, encode_row, Entity, EntityId, ReadyState, Row, ENTITY_RANGE_START,
};
use crate::error::{StoreError, StoreResult};
use crate::events::{ListenerSet, UpdateEvent, UpdateKind, UpdateListener};
use crate::expiration::{CacheKey, Evictable, ExpirationStrategy};
use crate::identity::{IdentityMap, RetentionPolicy};
use crate::version::VersionSource;
use cascade_codec::{decode_key, encode_key};
use cascade_kv::{KvTable, ScanRange};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Derives a class's value from the values of its sources for one id,
/// given in source order. `None` entries are sources with no value for
/// the id; returning `None` omits the entity from the derived class.
pub type TransformFn =
    Arc<dyn Fn(&[Option<serde_json::Value>]) -> Option<serde_json::Value> + Send + Sync>;

/// How a class's `dbVersion` fingerprint is derived.
#[derive(Debug, Clone)]
pub enum VersionSpec {
    /// An explicit numeric version.
    Explicit(u64),
    /// Fingerprint the transform's source text.
    SourceText(String),
    /// Fingerprint the contents of a source file; its modification time
    /// becomes the transform version.
    SourceFile(PathBuf),
}

/// Everything that defines a class, owned by the registry.
///
/// Runtime behavior dispatches through this descriptor: a descriptor
/// with a transform behaves as a derived (cached) class, one without is
/// a plain persisted class.
#[derive(Clone)]
pub struct ClassDescriptor {
    /// Unique class name; also the backing table name.
    pub name: String,
    /// How the schema fingerprint is computed.
    pub version_spec: VersionSpec,
    /// Classes this class derives from, in transform-argument order.
    pub sources: Vec<String>,
    /// Identity-map retention policy.
    pub retention: RetentionPolicy,
    /// Transform for derived classes.
    pub transform: Option<TransformFn>,
}

impl ClassDescriptor {
    /// Descriptor for a plain persisted class.
    #[must_use]
    pub fn persisted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_spec: VersionSpec::Explicit(1),
            sources: Vec::new(),
            retention: RetentionPolicy::Weak,
            transform: None,
        }
    }

    /// Descriptor for a class derived from `sources` through
    /// `transform`.
    #[must_use]
    pub fn cached(
        name: impl Into<String>,
        sources: Vec<String>,
        transform: TransformFn,
    ) -> Self {
        Self {
            name: name.into(),
            version_spec: VersionSpec::Explicit(1),
            sources,
            retention: RetentionPolicy::Weak,
            transform: Some(transform),
        }
    }

    /// Sets the version spec.
    #[must_use]
    pub fn with_version(mut self, spec: VersionSpec) -> Self {
        self.version_spec = spec;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

/// Result of a contextual value read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueOutcome {
    /// The caller's version is still current.
    NotModified,
    /// The entity has no value.
    Absent,
    /// The entity's current value.
    Value(serde_json::Value),
}

/// A registered entity class.
pub struct EntityClass {
    descriptor: ClassDescriptor,
    table: Arc<dyn KvTable>,
    identity: IdentityMap,
    batcher: Arc<WriteBatcher>,
    listeners: ListenerSet,
    versions: Arc<VersionSource>,
    expiration: Arc<ExpirationStrategy>,
    config: StoreConfig,
    track_previous: AtomicBool,
    start_version: AtomicU64,
    transform_version: Mutex<Option<u64>>,
    ready: Mutex<CompletionHandle>,
    resolved_sources: RwLock<Vec<Arc<EntityClass>>>,
}

impl EntityClass {
    /// Creates a class over its backing table. Registration (schema
    /// check, reset, source subscriptions) is the registry's job.
    #[must_use]
    pub fn new(
        descriptor: ClassDescriptor,
        table: Arc<dyn KvTable>,
        versions: Arc<VersionSource>,
        expiration: Arc<ExpirationStrategy>,
        config: StoreConfig,
    ) -> Arc<Self> {
        let batcher = Arc::new(WriteBatcher::new(
            Arc::clone(&table),
            Arc::clone(&versions),
            &config,
        ));
        Arc::new(Self {
            identity: IdentityMap::new(descriptor.retention),
            descriptor,
            table,
            batcher,
            listeners: ListenerSet::new(),
            versions,
            expiration,
            config,
            track_previous: AtomicBool::new(false),
            start_version: AtomicU64::new(0),
            transform_version: Mutex::new(None),
            ready: Mutex::new(CompletionHandle::resolved()),
            resolved_sources: RwLock::new(Vec::new()),
        })
    }

    /// Returns the class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Returns the class descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &ClassDescriptor {
        &self.descriptor
    }

    /// Returns the backing table.
    #[must_use]
    pub fn table(&self) -> &Arc<dyn KvTable> {
        &self.table
    }

    pub(crate) fn batcher(&self) -> &Arc<WriteBatcher> {
        &self.batcher
    }

    pub(crate) fn versions(&self) -> &Arc<VersionSource> {
        &self.versions
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn set_resolved_sources(&self, sources: Vec<Arc<EntityClass>>) {
        *self.resolved_sources.write() = sources;
    }

    /// Returns the resolved source classes, in descriptor order.
    #[must_use]
    pub fn sources(&self) -> Vec<Arc<EntityClass>> {
        self.resolved_sources.read().clone()
    }

    pub(crate) fn set_ready(&self, handle: CompletionHandle) {
        *self.ready.lock() = handle;
    }

    pub(crate) fn set_start_version(&self, version: u64) {
        self.start_version.store(version, Ordering::SeqCst);
    }

    /// Returns the version the class started from.
    #[must_use]
    pub fn start_version(&self) -> u64 {
        self.start_version.load(Ordering::SeqCst)
    }

    pub(crate) fn set_transform_version(&self, version: Option<u64>) {
        *self.transform_version.lock() = version;
    }

    /// Modification time of the transform's source file, when the class
    /// was registered from one.
    #[must_use]
    pub fn transform_version(&self) -> Option<u64> {
        *self.transform_version.lock()
    }

    /// Resolves when registration (including any reset) is complete.
    #[must_use]
    pub fn when_ready(&self) -> CompletionHandle {
        self.ready.lock().clone()
    }

    /// Resolves when the class's own update processing is complete.
    ///
    /// Classes apply updates synchronously, so this is always resolved;
    /// indexes consuming a class wait on it before starting their own
    /// pass, which keeps downstream ordering uniform.
    #[must_use]
    pub fn when_processing_complete(&self) -> CompletionHandle {
        CompletionHandle::resolved()
    }

    /// Asks the class to carry previous values on its update events.
    /// Set by any consumer that diffs old against new state.
    pub fn set_track_previous(&self) {
        self.track_previous.store(true, Ordering::SeqCst);
    }

    /// Registers a downstream listener.
    pub fn notifies(&self, listener: Arc<dyn UpdateListener>) {
        self.listeners.notifies(listener);
    }

    /// Deregisters a downstream listener.
    pub fn stop_notifies(&self, listener: &Arc<dyn UpdateListener>) {
        self.listeners.stop_notifies(listener);
    }

    /// Registers a callback for failed batch writes.
    pub fn on_db_failure(&self, callback: DbFailureCallback) {
        self.batcher.on_db_failure(callback);
    }

    /// Resolves when every write enqueued so far is durable.
    #[must_use]
    pub fn write_completion(&self) -> CompletionHandle {
        self.batcher.write_completion()
    }

    /// Flushes the open batch, if any, and waits for durability.
    pub fn flush_writes(&self) {
        self.batcher.flush_and_wait();
    }

    /// The class's last-version watermark.
    #[must_use]
    pub fn last_version(&self) -> u64 {
        self.batcher.last_version()
    }

    /// The class's effective version: its own watermark joined with
    /// every source's effective version.
    #[must_use]
    pub fn version(&self) -> u64 {
        let own = self.batcher.last_version();
        self.sources()
            .iter()
            .map(|source| source.version())
            .fold(own, u64::max)
    }

    /// Encoded table key for an id.
    pub(crate) fn id_key(&self, id: &EntityId) -> StoreResult<Vec<u8>> {
        Ok(encode_key(&id.to_key())?)
    }

    // ------------------------------------------------------------------
    // Instance access
    // ------------------------------------------------------------------

    /// Returns the canonical live instance for `id`.
    pub fn for_id(&self, id: &EntityId) -> Arc<Entity> {
        self.identity.get_or_insert(id)
    }

    /// Returns the canonical instance for a string id, rejecting
    /// strings that parse as positive numbers.
    pub fn for_str_id(&self, id: &str) -> StoreResult<Arc<Entity>> {
        Ok(self.for_id(&EntityId::parse(id)?))
    }

    /// Loads the canonical instances for `ids`, in input order, with a
    /// bounded number of loads in flight.
    pub fn for_ids(&self, ids: &[EntityId]) -> Vec<Arc<Entity>> {
        let mut results: Vec<Option<Arc<Entity>>> = vec![None; ids.len()];
        let cap = self.config.fetch_concurrency.max(1);
        for (chunk_ids, chunk_results) in
            ids.chunks(cap).zip(results.chunks_mut(cap))
        {
            thread::scope(|scope| {
                for (id, slot) in chunk_ids.iter().zip(chunk_results.iter_mut()) {
                    scope.spawn(move || {
                        let entity = self.for_id(id);
                        if entity.ready() == ReadyState::Unloaded {
                            self.load_latest_local_data(&entity);
                        }
                        *slot = Some(entity);
                    });
                }
            });
        }
        results
            .into_iter()
            .map(|slot| slot.expect("every slot filled by its task"))
            .collect()
    }

    // ------------------------------------------------------------------
    // Load and read
    // ------------------------------------------------------------------

    /// Reads the entity's row, resolving its ready state.
    ///
    /// `"v,json"` rows become up-to-date, `"v"` rows invalidated, and a
    /// missing row no-local-data with a freshly allocated version. Load
    /// errors retry once, then are logged and leave the entity
    /// invalidated.
    pub fn load_latest_local_data(&self, entity: &Arc<Entity>) {
        entity.state().ready = ReadyState::LoadingLocalData;
        let key = match self.id_key(&entity.id) {
            Ok(key) => key,
            Err(err) => {
                warn!(class = self.name(), id = %entity.id, %err, "unencodable id");
                entity.state().ready = ReadyState::Invalidated;
                return;
            }
        };

        match self.read_row(&entity.id, &key) {
            Ok(Some(bytes)) => match decode_row(&bytes) {
                Ok(Row { version, json }) => {
                    self.versions.observe(version);
                    let mut state = entity.state();
                    state.version = version;
                    state.cached_value = None;
                    match json {
                        Some(json) => {
                            state.as_json = Some(json);
                            state.ready = ReadyState::UpToDate;
                        }
                        None => {
                            state.as_json = None;
                            state.ready = ReadyState::Invalidated;
                        }
                    }
                    drop(state);
                    self.register_weight(entity);
                }
                Err(err) => {
                    warn!(class = self.name(), id = %entity.id, %err, "corrupt row");
                    let mut state = entity.state();
                    state.version = self.versions.next();
                    state.ready = ReadyState::Invalidated;
                }
            },
            Ok(None) => {
                let mut state = entity.state();
                state.version = self.versions.next();
                state.as_json = None;
                state.cached_value = None;
                state.ready = ReadyState::NoLocalData;
            }
            Err(err) => {
                // Absorbed: the entity stays invalidated and the
                // pipeline keeps running.
                warn!(class = self.name(), id = %entity.id, %err, "load failed");
                entity.state().ready = ReadyState::Invalidated;
            }
        }
    }

    /// Reads the raw row bytes for `id`, consulting pending batches
    /// first and retrying the engine once before reporting a
    /// load failure.
    fn read_row(&self, id: &EntityId, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if let Some(pending) = self.batcher.db_get(key) {
            return Ok(pending);
        }
        self.table
            .get(key)
            .or_else(|first| self.table.get(key).map_err(|_| first))
            .map_err(|err| StoreError::load_failed(self.name(), id.to_string(), err.to_string()))
    }

    fn register_weight(&self, entity: &Arc<Entity>) {
        let key = CacheKey::new(self.name(), entity.id.to_string());
        let target: Arc<dyn Evictable> = Arc::clone(entity) as Arc<dyn Evictable>;
        self.expiration
            .touch(key, entity.weight(), Arc::downgrade(&target));
    }

    /// Resolves the entity's value under a call context.
    ///
    /// Honours the context's `if_modified_since` hint, recomputes
    /// derived values when invalidated, and otherwise returns the cached
    /// deserialized value.
    pub fn value_of(&self, id: &EntityId, ctx: &Context) -> StoreResult<ValueOutcome> {
        let entity = self.for_id(id);
        if entity.ready() == ReadyState::Unloaded {
            self.load_latest_local_data(&entity);
        }

        if let Some(not_after) = ctx.if_modified_since {
            let version = entity.version();
            if version != 0 && version == not_after {
                return Ok(ValueOutcome::NotModified);
            }
        }

        {
            let mut state = entity.state();
            if let Some(value) = &state.cached_value {
                return Ok(ValueOutcome::Value(value.clone()));
            }
            if let Some(json) = &state.as_json {
                let value: serde_json::Value = serde_json::from_str(json)?;
                state.cached_value = Some(value.clone());
                drop(state);
                self.register_weight(&entity);
                return Ok(ValueOutcome::Value(value));
            }
        }

        if self.descriptor.transform.is_some() {
            // Derived class: rebuild the stale value from the sources.
            return match self.refresh_derived(&entity)? {
                Some(value) => Ok(ValueOutcome::Value(value)),
                None => Ok(ValueOutcome::Absent),
            };
        }
        Ok(ValueOutcome::Absent)
    }

    /// Scans ids and row versions with version greater than `since`.
    pub fn get_instance_ids_and_versions_since(
        &self,
        since: u64,
    ) -> StoreResult<Vec<(EntityId, u64)>> {
        let entries = self
            .table
            .scan(&ScanRange::all().gt(ENTITY_RANGE_START.to_vec()))?;
        let mut results = Vec::new();
        for entry in entries {
            let key = decode_key(&entry.key)?;
            let id = EntityId::from_key(&key)?;
            let row = decode_row(&entry.value)?;
            if row.version > since {
                results.push((id, row.version));
            }
        }
        Ok(results)
    }

    /// Scans every entity row carrying a value, in id order.
    pub fn entries(&self) -> StoreResult<Vec<(EntityId, serde_json::Value)>> {
        let entries = self
            .table
            .scan(&ScanRange::all().gt(ENTITY_RANGE_START.to_vec()))?;
        let mut results = Vec::new();
        for entry in entries {
            let key = decode_key(&entry.key)?;
            let id = EntityId::from_key(&key)?;
            let row = decode_row(&entry.value)?;
            if let Some(json) = row.json {
                results.push((id, serde_json::from_str(&json)?));
            }
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Writes a value through for `id`.
    pub fn set(&self, id: &EntityId, value: serde_json::Value) -> StoreResult<CompletionHandle> {
        let entity = self.for_id(id);
        self.set_value(&entity, value)
    }

    /// Writes a value through for an instance.
    ///
    /// Writes on a non-canonical instance are dropped with a warning.
    pub fn set_value(
        &self,
        entity: &Arc<Entity>,
        value: serde_json::Value,
    ) -> StoreResult<CompletionHandle> {
        if !self.identity.is_canonical(entity) {
            warn!(
                class = self.name(),
                id = %entity.id,
                "write on non-canonical instance dropped"
            );
            return Ok(self.batcher.write_completion());
        }
        if entity.ready() == ReadyState::Unloaded {
            self.load_latest_local_data(entity);
        }

        let json = serde_json::to_string(&value)?;
        let kind = if entity.ready() == ReadyState::NoLocalData {
            UpdateKind::Added
        } else {
            UpdateKind::Replaced
        };
        let mut event = UpdateEvent::new(kind, self.name(), entity.id.to_key());
        // The fresh value is being persisted; nothing to invalidate.
        event.no_reset = true;
        self.prepare_event(entity, &mut event);
        let version = event.version.expect("prepared event carries a version");

        {
            let mut state = entity.state();
            state.version = version;
            state.as_json = Some(json.clone());
            state.cached_value = Some(value);
            state.ready = ReadyState::UpToDate;
        }
        let key = self.id_key(&entity.id)?;
        let handle = self
            .batcher
            .put(key, encode_row(version, Some(&json)), version);
        event.when_written = Some(handle.clone());
        self.register_weight(entity);
        self.listeners.emit(&mut event);
        Ok(handle)
    }

    /// Merges a JSON object into the entity's current value.
    ///
    /// The merge is last-writer-wins against the in-memory value; there
    /// is no read-modify-write guard beyond the single-writer-per-class
    /// model.
    pub fn patch(
        &self,
        id: &EntityId,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<CompletionHandle> {
        let current = match self.value_of(id, &Context::new())? {
            ValueOutcome::Value(value) => value,
            _ => serde_json::Value::Object(serde_json::Map::new()),
        };
        let mut merged = match current {
            serde_json::Value::Object(map) => map,
            other => {
                warn!(class = self.name(), %id, ?other, "patch over non-object value");
                serde_json::Map::new()
            }
        };
        for (key, value) in properties {
            merged.insert(key, value);
        }
        self.set(id, serde_json::Value::Object(merged))
    }

    /// Removes `id`: enqueues the delete, drops the live instance, and
    /// fires a deleted event.
    pub fn remove(&self, id: &EntityId) -> StoreResult<CompletionHandle> {
        let mut event = UpdateEvent::new(UpdateKind::Deleted, self.name(), id.to_key());
        self.remove_with(id, &mut event)
    }

    /// Removes `id`, publishing through a caller-supplied event so
    /// origins and downstream handles propagate along update chains.
    pub fn remove_with(
        &self,
        id: &EntityId,
        event: &mut UpdateEvent,
    ) -> StoreResult<CompletionHandle> {
        let entity = self.for_id(id);
        if entity.ready() == ReadyState::Unloaded {
            self.load_latest_local_data(&entity);
        }
        event.no_reset = true;
        self.prepare_event(&entity, event);
        let version = event.version.expect("prepared event carries a version");

        let key = self.id_key(id)?;
        let handle = self.batcher.delete(key, version);
        self.identity.remove(id);
        self.expiration
            .forget(&CacheKey::new(self.name(), id.to_string()));
        event.when_written = Some(handle.clone());
        self.listeners.emit(event);
        Ok(handle)
    }

    /// Applies an externally signalled update to `id`: captures the
    /// previous value when tracked, allocates a version unless the event
    /// carries one, publishes to listeners, resets the cache unless the
    /// event suppresses it, and attaches the write completion.
    pub fn updated(&self, id: &EntityId, event: &mut UpdateEvent) -> StoreResult<CompletionHandle> {
        let entity = self.for_id(id);
        self.prepare_event(&entity, event);
        let version = event.version.expect("prepared event carries a version");
        entity.state().version = version;

        self.listeners.emit(event);
        if !event.no_reset {
            self.reset_cache(&entity, version)?;
        }
        let handle = self.batcher.write_completion();
        event.when_written = Some(handle.clone());
        Ok(handle)
    }

    /// Captures the previous value (when tracked) and ensures the event
    /// carries a version.
    pub(crate) fn prepare_event(&self, entity: &Arc<Entity>, event: &mut UpdateEvent) {
        if self.track_previous.load(Ordering::SeqCst) && event.previous.is_none() {
            if entity.ready() == ReadyState::Unloaded {
                self.load_latest_local_data(entity);
            }
            event.previous = Some(entity.state().as_json.clone());
        }
        match event.version {
            Some(version) => self.versions.observe(version),
            None => event.version = Some(self.versions.next()),
        }
    }

    /// Invalidates the entity's cache. Derived classes persist the fact
    /// with a version-only row so staleness survives restarts; plain
    /// classes only drop in-memory state.
    pub(crate) fn reset_cache(&self, entity: &Arc<Entity>, version: u64) -> StoreResult<()> {
        if self.descriptor.transform.is_some() {
            {
                let mut state = entity.state();
                state.as_json = None;
                state.cached_value = None;
                state.ready = ReadyState::Invalidated;
                state.version = version;
            }
            let key = self.id_key(&entity.id)?;
            self.batcher.put(key, encode_row(version, None), version);
        } else {
            entity.clear_cache();
        }
        Ok(())
    }

    /// Resets the class wholesale. Plain classes clear their table when
    /// asked; derived classes additionally reseed invalidation rows from
    /// their sources so downstream state rebuilds.
    pub fn reset_all(&self, clear_db: bool) -> StoreResult<()> {
        if clear_db {
            self.table.clear()?;
        }
        for entity in self.identity.live() {
            entity.clear_cache();
        }
        if self.descriptor.transform.is_some() {
            self.reseed_from_sources()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityClass")
            .field("name", &self.descriptor.name)
            .field("sources", &self.descriptor.sources)
            .field("last_version", &self.last_version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_kv::{KvEngine, MemoryEngine};
    use serde_json::json;
    use std::time::Duration;

    fn test_class(name: &str) -> (MemoryEngine, Arc<EntityClass>) {
        let engine = MemoryEngine::new();
        let table = engine.open(name).unwrap();
        let class = EntityClass::new(
            ClassDescriptor::persisted(name),
            table,
            Arc::new(VersionSource::new()),
            Arc::new(ExpirationStrategy::new(1 << 20)),
            StoreConfig::new().batch_linger(Duration::from_millis(1)),
        );
        (engine, class)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        class.set(&id, json!({"a": 1})).unwrap().wait();
        assert_eq!(
            class.value_of(&id, &Context::new()).unwrap(),
            ValueOutcome::Value(json!({"a": 1}))
        );
    }

    #[test]
    fn row_bytes_have_version_comma_json_form() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        class.set(&id, json!({"a": 1})).unwrap().wait();

        let key = class.id_key(&id).unwrap();
        let bytes = class.table().get(&key).unwrap().unwrap();
        let row = decode_row(&bytes).unwrap();
        assert_eq!(row.json.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(row.version, class.for_id(&id).version());
    }

    #[test]
    fn versions_never_decrease() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        let mut last = 0;
        for i in 0..5 {
            class.set(&id, json!({ "i": i })).unwrap();
            let version = class.for_id(&id).version();
            assert!(version > last);
            last = version;
        }
    }

    #[test]
    fn remove_leaves_no_row() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        class.set(&id, json!(1)).unwrap().wait();
        class.remove(&id).unwrap().wait();
        assert_eq!(
            class.value_of(&id, &Context::new()).unwrap(),
            ValueOutcome::Absent
        );
        let key = class.id_key(&id).unwrap();
        assert_eq!(class.table().get(&key).unwrap(), None);
    }

    #[test]
    fn if_modified_since_returns_not_modified() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        class.set(&id, json!(1)).unwrap().wait();
        let version = class.for_id(&id).version();

        let ctx = Context::new().if_modified_since(version);
        assert_eq!(
            class.value_of(&id, &ctx).unwrap(),
            ValueOutcome::NotModified
        );
        let stale = Context::new().if_modified_since(version - 1);
        assert!(matches!(
            class.value_of(&id, &stale).unwrap(),
            ValueOutcome::Value(_)
        ));
    }

    #[test]
    fn non_canonical_write_is_dropped() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        class.set(&id, json!({"keep": true})).unwrap().wait();

        let rogue = Arc::new(Entity::new(id.clone()));
        class.set_value(&rogue, json!({"evil": true})).unwrap().wait();
        assert_eq!(
            class.value_of(&id, &Context::new()).unwrap(),
            ValueOutcome::Value(json!({"keep": true}))
        );
    }

    #[test]
    fn reload_after_eviction_yields_same_value() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        class.set(&id, json!({"a": [1, 2, 3]})).unwrap().wait();

        let entity = class.for_id(&id);
        entity.clear_cache();
        assert_eq!(
            class.value_of(&id, &Context::new()).unwrap(),
            ValueOutcome::Value(json!({"a": [1, 2, 3]}))
        );
    }

    #[test]
    fn patch_merges_last_writer_wins() {
        let (_engine, class) = test_class("foo");
        let id = EntityId::Num(1);
        class.set(&id, json!({"a": 1, "b": 2})).unwrap().wait();

        let mut patch = serde_json::Map::new();
        patch.insert("b".into(), json!(20));
        patch.insert("c".into(), json!(30));
        class.patch(&id, patch).unwrap().wait();

        assert_eq!(
            class.value_of(&id, &Context::new()).unwrap(),
            ValueOutcome::Value(json!({"a": 1, "b": 20, "c": 30}))
        );
    }

    #[test]
    fn for_ids_preserves_input_order() {
        let (_engine, class) = test_class("foo");
        for i in 1..=9u64 {
            class.set(&EntityId::Num(i), json!(i)).unwrap();
        }
        let ids: Vec<EntityId> = (1..=9u64).rev().map(EntityId::Num).collect();
        let entities = class.for_ids(&ids);
        let got: Vec<String> = entities.iter().map(|e| e.id.to_string()).collect();
        let want: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn ids_and_versions_since_filters() {
        let (_engine, class) = test_class("foo");
        class.set(&EntityId::Num(1), json!(1)).unwrap().wait();
        let midpoint = class.last_version();
        class.set(&EntityId::Num(2), json!(2)).unwrap().wait();

        let since = class.get_instance_ids_and_versions_since(midpoint).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].0, EntityId::Num(2));
    }

    #[test]
    fn failed_load_leaves_entity_invalidated() {
        use cascade_kv::{BatchOp, KvEntry, KvError, KvResult, ScanRange};

        struct FailingReads;

        impl cascade_kv::KvTable for FailingReads {
            fn name(&self) -> &str {
                "failing"
            }
            fn get(&self, _key: &[u8]) -> KvResult<Option<Vec<u8>>> {
                Err(KvError::corrupt("injected read failure"))
            }
            fn put(&self, _key: &[u8], _value: &[u8]) -> KvResult<()> {
                Ok(())
            }
            fn remove_sync(&self, _key: &[u8]) -> KvResult<()> {
                Ok(())
            }
            fn batch(&self, _ops: Vec<BatchOp>) -> KvResult<()> {
                Ok(())
            }
            fn scan(&self, _range: &ScanRange) -> KvResult<Vec<KvEntry>> {
                Ok(Vec::new())
            }
            fn clear(&self) -> KvResult<()> {
                Ok(())
            }
            fn wait_for_all_writes(&self) -> KvResult<()> {
                Ok(())
            }
        }

        let class = EntityClass::new(
            ClassDescriptor::persisted("failing"),
            Arc::new(FailingReads),
            Arc::new(VersionSource::new()),
            Arc::new(ExpirationStrategy::new(1 << 20)),
            StoreConfig::new().batch_linger(Duration::from_millis(1)),
        );

        let id = EntityId::Num(1);
        let err = class.read_row(&id, &class.id_key(&id).unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::LoadFailed { .. }));

        // The public path absorbs the failure: invalidated, not wedged.
        let entity = class.for_id(&id);
        class.load_latest_local_data(&entity);
        assert_eq!(entity.ready(), ReadyState::Invalidated);
    }

    #[test]
    fn previous_value_captured_when_tracked() {
        let (_engine, class) = test_class("foo");
        class.set_track_previous();
        let id = EntityId::Num(1);
        class.set(&id, json!({"v": 1})).unwrap().wait();

        struct Capture {
            previous: Mutex<Option<Option<String>>>,
        }
        impl UpdateListener for Capture {
            fn on_update(&self, event: &mut UpdateEvent) {
                *self.previous.lock() = event.previous.clone();
            }
        }
        let capture = Arc::new(Capture {
            previous: Mutex::new(None),
        });
        class.notifies(capture.clone());

        class.set(&id, json!({"v": 2})).unwrap().wait();
        let captured = capture.previous.lock().clone();
        assert_eq!(captured, Some(Some(r#"{"v":1}"#.to_string())));
    }
}
